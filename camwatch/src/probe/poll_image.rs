//! HTTP snapshot / MJPEG liveness check.

use std::time::Duration;

use async_trait::async_trait;
use media_types::{ImageFormat, find_jpeg_start, looks_like_markup};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ProbeFailure, ProbeOutcome, ProbeRequest, ProbeResult, Prober, bounded};
use crate::registry::Protocol;
use crate::utils::http_client::build_probe_client;
use crate::utils::url::split_credentials;

/// Poll-image prober settings (`[engine.poll_image]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollImageConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on body bytes read per probe.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_user_agent() -> String {
    concat!("camwatch/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for PollImageConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

impl PollImageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub struct PollImageProber {
    client: reqwest::Client,
    max_payload_bytes: usize,
}

impl PollImageProber {
    pub fn new(config: PollImageConfig) -> crate::Result<Self> {
        let client = build_probe_client(&config.user_agent, 4)?;
        Ok(Self::with_client(client, config.max_payload_bytes))
    }

    pub fn with_client(client: reqwest::Client, max_payload_bytes: usize) -> Self {
        Self {
            client,
            max_payload_bytes: max_payload_bytes.max(ImageFormat::SNIFF_LEN),
        }
    }

    async fn check(&self, endpoint: &str) -> Result<String, ProbeFailure> {
        let (url, credentials) = split_credentials(endpoint)
            .map_err(|e| ProbeFailure::new(ProbeOutcome::ProtocolError, format!("invalid url: {e}")))?;

        let mut request = self.client.get(url);
        if let Some(creds) = credentials {
            request = request.basic_auth(creds.username, creds.password);
        }

        let mut response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProbeFailure::new(
                ProbeOutcome::AuthFailure,
                format!("HTTP {status}"),
            ));
        }
        if !status.is_success() {
            return Err(ProbeFailure::new(
                ProbeOutcome::ProtocolError,
                format!("HTTP {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let multipart = content_type.starts_with("multipart/x-mixed-replace");

        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_transport)? {
            let room = self.max_payload_bytes - body.len();
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);

            if multipart {
                if let Some(offset) = find_jpeg_start(&body) {
                    return Ok(format!("MJPEG frame at byte {offset}"));
                }
            } else if body.len() >= ImageFormat::SNIFF_LEN {
                break;
            }
            if body.len() >= self.max_payload_bytes {
                break;
            }
        }

        if multipart {
            return Err(ProbeFailure::new(
                ProbeOutcome::PayloadInvalid,
                format!("no JPEG frame in the first {} bytes", body.len()),
            ));
        }
        validate_still(&body, &content_type)
    }
}

/// Decide whether the leading bytes of a body are a still image.
fn validate_still(body: &[u8], content_type: &str) -> Result<String, ProbeFailure> {
    if body.is_empty() {
        return Err(ProbeFailure::new(ProbeOutcome::PayloadInvalid, "empty body"));
    }
    if let Some(format) = ImageFormat::sniff(body) {
        return Ok(format!("{format} image"));
    }
    if looks_like_markup(body) || content_type.starts_with("text/") {
        return Err(ProbeFailure::new(
            ProbeOutcome::PayloadInvalid,
            format!("error page instead of an image ({content_type})"),
        ));
    }
    let head = &body[..body.len().min(8)];
    Err(ProbeFailure::new(
        ProbeOutcome::PayloadInvalid,
        format!("unrecognized image signature {}", hex_prefix(head)),
    ))
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn classify_transport(err: reqwest::Error) -> ProbeFailure {
    let outcome = if err.is_connect() {
        ProbeOutcome::ConnectionRefused
    } else if err.is_timeout() {
        ProbeOutcome::Timeout
    } else {
        ProbeOutcome::ProtocolError
    };
    ProbeFailure::new(outcome, err.to_string())
}

#[async_trait]
impl Prober for PollImageProber {
    fn protocol(&self) -> Protocol {
        Protocol::PollImage
    }

    async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
        let result = bounded(request, self.check(&request.endpoint)).await;
        debug!(
            stream = %request.stream_name,
            outcome = %result.outcome,
            latency_ms = result.latency_ms(),
            "http probe finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01];

    /// Serve a single canned HTTP response per connection.
    async fn serve(head: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = sock.read(&mut buf).await;
                    let mut out = head.as_bytes().to_vec();
                    out.extend_from_slice(&body);
                    let _ = sock.write_all(&out).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://127.0.0.1:{port}/snapshot.jpg")
    }

    fn prober() -> PollImageProber {
        crate::utils::http_client::install_rustls_provider();
        PollImageProber::with_client(reqwest::Client::new(), 64 * 1024)
    }

    fn request(endpoint: String) -> ProbeRequest {
        ProbeRequest {
            stream_name: "lobby".to_string(),
            protocol: Protocol::PollImage,
            endpoint,
            timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test]
    async fn test_jpeg_snapshot_succeeds() {
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nConnection: close\r\n\r\n",
            JPEG.to_vec(),
        )
        .await;
        let result = prober().probe(&request(url)).await;
        assert_eq!(result.outcome, ProbeOutcome::Success, "{}", result.message);
        assert_eq!(result.message, "JPEG image");
    }

    #[tokio::test]
    async fn test_html_error_page_is_payload_invalid() {
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n",
            b"<html><body>Camera offline</body></html>".to_vec(),
        )
        .await;
        let result = prober().probe(&request(url)).await;
        assert_eq!(result.outcome, ProbeOutcome::PayloadInvalid);
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let url = serve(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Vec::new(),
        )
        .await;
        let result = prober().probe(&request(url)).await;
        assert_eq!(result.outcome, ProbeOutcome::AuthFailure);
        assert!(result.message.contains("401"));
    }

    #[tokio::test]
    async fn test_server_error_is_protocol_error() {
        let url = serve(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Vec::new(),
        )
        .await;
        let result = prober().probe(&request(url)).await;
        assert_eq!(result.outcome, ProbeOutcome::ProtocolError);
    }

    #[tokio::test]
    async fn test_mjpeg_multipart() {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(JPEG);
        let url = serve(
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nConnection: close\r\n\r\n",
            body,
        )
        .await;
        let result = prober().probe(&request(url)).await;
        assert_eq!(result.outcome, ProbeOutcome::Success, "{}", result.message);
    }

    #[tokio::test]
    async fn test_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = prober()
            .probe(&request(format!("http://127.0.0.1:{port}/snap.jpg")))
            .await;
        assert_eq!(result.outcome, ProbeOutcome::ConnectionRefused);
    }

    #[rstest]
    #[case(b"", "empty body")]
    #[case(b"<!DOCTYPE html>", "error page")]
    #[case(b"\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b", "unrecognized")]
    fn test_validate_still_rejections(#[case] body: &[u8], #[case] needle: &str) {
        let failure = validate_still(body, "image/jpeg").unwrap_err();
        assert_eq!(failure.outcome, ProbeOutcome::PayloadInvalid);
        assert!(failure.message.contains(needle), "{}", failure.message);
    }
}
