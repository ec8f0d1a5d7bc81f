//! RTSP/1.0 message framing.
//!
//! Requests are encoded into a byte buffer; responses and interleaved
//! binary frames are decoded incrementally from a growing read buffer.

use bytes::{Buf, BytesMut};
use memchr::memmem;

use crate::{Result, RtspError};

const CRLF2: &[u8] = b"\r\n\r\n";
const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Teardown => "TEARDOWN",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize with the given `CSeq`.
    pub fn encode(&self, cseq: u32) -> Vec<u8> {
        let mut out = format!("{} {} RTSP/1.0\r\nCSeq: {cseq}\r\n", self.method, self.uri);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    /// Case-insensitive lookup of the first header with this name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a repeated header, such as `WWW-Authenticate`.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Session identifier without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.header("Session")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
            .filter(|v| !v.is_empty())
    }
}

/// RTP/RTCP data carried inline on the control connection (`$` framing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

/// Anything the server can send on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Response(Response),
    /// Server-to-client request (for example `GET_PARAMETER` keepalives); skipped.
    Request { method: String },
    Frame(InterleavedFrame),
}

/// Try to decode one message from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
/// removed from `buf`.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Incoming>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == b'$' {
        if buf.len() < 4 {
            return Ok(None);
        }
        let channel = buf[1];
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        buf.advance(4);
        let payload = buf.split_to(len).to_vec();
        return Ok(Some(Incoming::Frame(InterleavedFrame { channel, payload })));
    }

    let Some(head_end) = memmem::find(&buf[..], CRLF2) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(RtspError::Malformed("header section too large".to_string()));
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| RtspError::Malformed("non utf-8 header".to_string()))?;
    let mut lines = head.split("\r\n");
    let start_line = lines.next().unwrap_or_default();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RtspError::Malformed(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| {
            v.parse::<usize>()
                .map_err(|_| RtspError::Malformed(format!("bad Content-Length: {v}")))
        })
        .transpose()?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(RtspError::Malformed(format!(
            "body of {content_length} bytes exceeds limit"
        )));
    }

    let total = head_end + CRLF2.len() + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let incoming = if let Some(rest) = start_line.strip_prefix("RTSP/") {
        let mut parts = rest.splitn(3, ' ');
        let _version = parts.next();
        let code = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| RtspError::Malformed(format!("bad status line: {start_line}")))?;
        let reason = parts.next().unwrap_or_default().to_string();
        let body = buf[head_end + CRLF2.len()..total].to_vec();
        Incoming::Response(Response {
            code,
            reason,
            headers,
            body,
        })
    } else if start_line.ends_with("RTSP/1.0") {
        let method = start_line
            .split(' ')
            .next()
            .unwrap_or_default()
            .to_string();
        Incoming::Request { method }
    } else {
        return Err(RtspError::Malformed(format!(
            "unrecognized start line: {start_line}"
        )));
    };

    buf.advance(total);
    Ok(Some(incoming))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        let req = Request::new(Method::Describe, "rtsp://cam/live").header("Accept", "application/sdp");
        let text = String::from_utf8(req.encode(2)).unwrap();
        assert_eq!(
            text,
            "DESCRIBE rtsp://cam/live RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"
        );
    }

    #[test]
    fn test_decode_response_incrementally() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\ncontent-length: 5\r\nSession: 1234;timeout=60\r\n\r\nv=0\r\n";
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&raw[..20]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&raw[20..raw.len() - 2]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&raw[raw.len() - 2..]);

        let Some(Incoming::Response(resp)) = decode(&mut buf).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.code, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.cseq(), Some(2));
        assert_eq!(resp.session_id(), Some("1234"));
        assert_eq!(resp.body, b"v=0\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_interleaved_then_response() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'$', 0, 0, 3, 1, 2, 3]);
        buf.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n");

        let first = decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            first,
            Incoming::Frame(InterleavedFrame {
                channel: 0,
                payload: vec![1, 2, 3]
            })
        );
        let second = decode(&mut buf).unwrap().unwrap();
        assert!(matches!(second, Incoming::Response(r) if r.code == 200));
    }

    #[test]
    fn test_decode_server_request() {
        let mut buf = BytesMut::from(&b"GET_PARAMETER rtsp://cam/live RTSP/1.0\r\nCSeq: 1\r\n\r\n"[..]);
        let msg = decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            Incoming::Request {
                method: "GET_PARAMETER".to_string()
            }
        );
    }

    #[test]
    fn test_decode_garbage() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 400 Bad Request\r\n\r\n"[..]);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_repeated_headers() {
        let mut buf = BytesMut::from(
            &b"RTSP/1.0 401 Unauthorized\r\nCSeq: 3\r\nWWW-Authenticate: Digest realm=\"a\", nonce=\"b\"\r\nWWW-Authenticate: Basic realm=\"a\"\r\n\r\n"[..],
        );
        let Some(Incoming::Response(resp)) = decode(&mut buf).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.headers_named("www-authenticate").count(), 2);
    }
}
