//! Control-connection session.
//!
//! Timeouts are the caller's concern: every method here is cancel-safe in
//! the sense that dropping the future drops the socket.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::auth::{Challenge, Credentials};
use crate::message::{self, Incoming, InterleavedFrame, Method, Request, Response};
use crate::rtp::RtpHeader;
use crate::sdp::{self, SessionDescription};
use crate::{Result, RtspError, RtspUrl};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_agent: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("camwatch-rtsp/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Result of a successful `DESCRIBE`.
#[derive(Debug, Clone)]
pub struct Presentation {
    pub sdp: SessionDescription,
    /// Base URL used to resolve track controls.
    pub base: String,
}

/// First RTP packet received after `PLAY`.
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub channel: u8,
    pub header: RtpHeader,
}

pub struct RtspSession {
    stream: TcpStream,
    buf: BytesMut,
    url: RtspUrl,
    config: SessionConfig,
    credentials: Option<Credentials>,
    challenge: Option<Challenge>,
    cseq: u32,
    nonce_count: u32,
    session_id: Option<String>,
}

impl RtspSession {
    /// Open the TCP control connection. Resolution and connect failures map
    /// to [`RtspError::Connect`].
    pub async fn connect(url: RtspUrl, config: SessionConfig) -> Result<Self> {
        let stream = TcpStream::connect(url.authority())
            .await
            .map_err(RtspError::Connect)?;
        let _ = stream.set_nodelay(true);

        let credentials = url.username().map(|username| Credentials {
            username: username.to_string(),
            password: url.password().unwrap_or_default().to_string(),
        });

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            url,
            config,
            credentials,
            challenge: None,
            cseq: 0,
            nonce_count: 0,
            session_id: None,
        })
    }

    pub fn url(&self) -> &RtspUrl {
        &self.url
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub async fn options(&mut self) -> Result<Response> {
        let uri = self.url.request_uri().to_string();
        let resp = self.send(Request::new(Method::Options, uri)).await?;
        ensure_success(Method::Options, resp)
    }

    pub async fn describe(&mut self) -> Result<Presentation> {
        let uri = self.url.request_uri().to_string();
        let req = Request::new(Method::Describe, uri.clone()).header("Accept", "application/sdp");
        let resp = ensure_success(Method::Describe, self.send(req).await?)?;

        let body = String::from_utf8_lossy(&resp.body);
        let sdp = SessionDescription::parse(&body);
        let base = resp
            .header("Content-Base")
            .or_else(|| resp.header("Content-Location"))
            .map(str::to_string)
            .unwrap_or(uri);
        Ok(Presentation { sdp, base })
    }

    /// `SETUP` the first video track (or the first track of any kind) over
    /// interleaved channels 0-1.
    pub async fn setup_video(&mut self, presentation: &Presentation) -> Result<()> {
        let media = presentation
            .sdp
            .first_video()
            .or_else(|| presentation.sdp.media.first())
            .ok_or(RtspError::NoVideoTrack)?;
        let track = sdp::resolve_control(&presentation.base, media.control.as_deref());
        let req = Request::new(Method::Setup, track)
            .header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1");
        let resp = ensure_success(Method::Setup, self.send(req).await?)?;

        let session = resp
            .session_id()
            .ok_or_else(|| RtspError::Malformed("SETUP response without Session".to_string()))?;
        self.session_id = Some(session.to_string());
        Ok(())
    }

    pub async fn play(&mut self, presentation: &Presentation) -> Result<()> {
        let uri = session_uri(presentation);
        let req = Request::new(Method::Play, uri).header("Range", "npt=0.000-");
        ensure_success(Method::Play, self.send(req).await?)?;
        Ok(())
    }

    /// Wait for the first RTP packet with a non-empty payload on an even
    /// (RTP, not RTCP) channel.
    pub async fn next_media_unit(&mut self) -> Result<MediaUnit> {
        loop {
            match self.read_incoming().await? {
                Incoming::Frame(InterleavedFrame { channel, payload }) => {
                    if channel % 2 != 0 {
                        trace!(channel, "skipping rtcp frame");
                        continue;
                    }
                    let header = RtpHeader::parse(&payload)?;
                    if header.payload_len == 0 {
                        continue;
                    }
                    return Ok(MediaUnit { channel, header });
                }
                Incoming::Response(resp) => {
                    trace!(code = resp.code, "ignoring response while waiting for media");
                }
                Incoming::Request { method } => {
                    trace!(%method, "ignoring server request");
                }
            }
        }
    }

    /// Send `TEARDOWN` without waiting for the reply.
    pub async fn teardown(&mut self, presentation: &Presentation) -> Result<()> {
        let uri = session_uri(presentation);
        let req = self.prepare(Request::new(Method::Teardown, uri));
        self.cseq += 1;
        let bytes = req.encode(self.cseq);
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Send a request, retrying once with credentials on `401`.
    async fn send(&mut self, request: Request) -> Result<Response> {
        let mut retried = false;
        loop {
            let req = self.prepare(request.clone());
            self.cseq += 1;
            let cseq = self.cseq;
            debug!(method = %req.method, cseq, "rtsp request");
            self.stream.write_all(&req.encode(cseq)).await?;

            let resp = self.read_response(cseq).await?;
            match resp.code {
                401 if !retried => {
                    if self.credentials.is_none() {
                        return Err(RtspError::Unauthorized { code: 401 });
                    }
                    self.challenge = Some(Challenge::select(resp.headers_named("WWW-Authenticate"))?);
                    self.nonce_count = 0;
                    retried = true;
                }
                401 | 403 => return Err(RtspError::Unauthorized { code: resp.code }),
                _ => return Ok(resp),
            }
        }
    }

    fn prepare(&mut self, mut request: Request) -> Request {
        request = request.header("User-Agent", self.config.user_agent.clone());
        if let Some(session) = &self.session_id {
            request = request.header("Session", session.clone());
        }
        if let (Some(challenge), Some(creds)) = (&self.challenge, &self.credentials) {
            self.nonce_count += 1;
            let value = challenge.authorize(
                creds,
                request.method.as_str(),
                &request.uri,
                self.nonce_count,
            );
            request = request.header("Authorization", value);
        }
        request
    }

    async fn read_response(&mut self, cseq: u32) -> Result<Response> {
        loop {
            match self.read_incoming().await? {
                Incoming::Response(resp) => {
                    // Responses without CSeq are accepted; some firmwares omit it.
                    if resp.cseq().is_none_or(|c| c == cseq) {
                        return Ok(resp);
                    }
                    trace!(expected = cseq, got = ?resp.cseq(), "skipping stale response");
                }
                Incoming::Frame(_) => {}
                Incoming::Request { method } => {
                    trace!(%method, "ignoring server request");
                }
            }
        }
    }

    async fn read_incoming(&mut self) -> Result<Incoming> {
        loop {
            if let Some(msg) = message::decode(&mut self.buf)? {
                return Ok(msg);
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(RtspError::Closed);
            }
        }
    }
}

fn ensure_success(method: Method, resp: Response) -> Result<Response> {
    if resp.is_success() {
        Ok(resp)
    } else {
        Err(RtspError::Status {
            method: method.as_str(),
            code: resp.code,
            reason: resp.reason,
        })
    }
}

fn session_uri(presentation: &Presentation) -> String {
    sdp::resolve_control(&presentation.base, presentation.sdp.control.as_deref())
}

/// How far [`check_stream`] got.
#[derive(Debug, Clone)]
pub struct StreamCheck {
    /// `None` when media was not requested.
    pub first_unit: Option<MediaUnit>,
}

/// Full liveness check: `OPTIONS`, `DESCRIBE`, and when `require_media` is
/// set `SETUP`/`PLAY` until the first RTP packet, then `TEARDOWN`.
pub async fn check_stream(
    url: RtspUrl,
    config: SessionConfig,
    require_media: bool,
) -> Result<StreamCheck> {
    let mut session = RtspSession::connect(url, config).await?;
    match session.options().await {
        Ok(_) => {}
        // OPTIONS is optional on a number of firmwares; DESCRIBE decides.
        Err(RtspError::Status { code, .. }) => debug!(code, "OPTIONS not supported"),
        Err(e) => return Err(e),
    }
    let presentation = session.describe().await?;
    if !require_media {
        return Ok(StreamCheck { first_unit: None });
    }

    session.setup_video(&presentation).await?;
    session.play(&presentation).await?;
    let unit = session.next_media_unit().await?;
    if let Err(e) = session.teardown(&presentation).await {
        debug!(error = %e, "teardown failed");
    }
    Ok(StreamCheck {
        first_unit: Some(unit),
    })
}
