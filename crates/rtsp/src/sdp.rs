//! Just enough SDP to find the video track's control URL.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    /// Media type from the `m=` line (`video`, `audio`, ...).
    pub kind: String,
    pub control: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDescription {
    /// Session-level `a=control`.
    pub control: Option<String>,
    pub media: Vec<MediaSection>,
}

impl SessionDescription {
    pub fn parse(body: &str) -> Self {
        let mut sdp = SessionDescription::default();
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("m=") {
                let kind = rest.split(' ').next().unwrap_or_default().to_string();
                sdp.media.push(MediaSection {
                    kind,
                    control: None,
                });
            } else if let Some(control) = line.strip_prefix("a=control:") {
                let control = Some(control.trim().to_string());
                match sdp.media.last_mut() {
                    Some(media) => media.control = control,
                    None => sdp.control = control,
                }
            }
        }
        sdp
    }

    pub fn first_video(&self) -> Option<&MediaSection> {
        self.media.iter().find(|m| m.kind.eq_ignore_ascii_case("video"))
    }
}

/// Resolve a track control attribute against the presentation base URL.
///
/// `base` is `Content-Base`, `Content-Location` or the request URI, in that
/// order of preference.
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("") | Some("*") => base.to_string(),
        Some(c) if c.contains("://") => c.to_string(),
        Some(c) => {
            if base.ends_with('/') {
                format!("{base}{c}")
            } else {
                format!("{base}/{c}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Stream\r\n\
a=control:*\r\n\
m=audio 0 RTP/AVP 0\r\n\
a=control:trackID=0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:trackID=1\r\n";

    #[test]
    fn test_first_video() {
        let sdp = SessionDescription::parse(SDP);
        assert_eq!(sdp.control.as_deref(), Some("*"));
        assert_eq!(sdp.media.len(), 2);
        let video = sdp.first_video().unwrap();
        assert_eq!(video.control.as_deref(), Some("trackID=1"));
    }

    #[test]
    fn test_no_video() {
        let sdp = SessionDescription::parse("v=0\r\nm=audio 0 RTP/AVP 0\r\n");
        assert!(sdp.first_video().is_none());
    }

    #[test]
    fn test_resolve_control() {
        assert_eq!(
            resolve_control("rtsp://cam/live/", Some("trackID=1")),
            "rtsp://cam/live/trackID=1"
        );
        assert_eq!(
            resolve_control("rtsp://cam/live", Some("trackID=1")),
            "rtsp://cam/live/trackID=1"
        );
        assert_eq!(
            resolve_control("rtsp://cam/live", Some("rtsp://cam/other")),
            "rtsp://cam/other"
        );
        assert_eq!(resolve_control("rtsp://cam/live", None), "rtsp://cam/live");
    }
}
