//! Stream definitions and per-entry validation.

use serde::{Deserialize, Serialize};
use url::Url;

/// Wire protocol family of a camera endpoint.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// Session-oriented streaming (RTSP).
    #[strum(to_string = "pull-stream", serialize = "rtsp")]
    #[serde(alias = "rtsp")]
    PullStream,
    /// Single HTTP fetch of a still image or MJPEG stream.
    #[strum(to_string = "poll-image", serialize = "mjpeg", serialize = "http", serialize = "image")]
    #[serde(alias = "mjpeg", alias = "http", alias = "image")]
    PollImage,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Infer the protocol from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "rtsp" => Some(Self::PullStream),
            "http" | "https" => Some(Self::PollImage),
            _ => None,
        }
    }

    fn accepts_scheme(&self, scheme: &str) -> bool {
        Protocol::from_scheme(scheme) == Some(*self)
    }
}

/// Raw stream entry as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StreamEntry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: None,
            url: url.into(),
            enabled: true,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A validated stream. Immutable once part of a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDefinition {
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub enabled: bool,
}

impl TryFrom<&StreamEntry> for StreamDefinition {
    type Error = String;

    fn try_from(entry: &StreamEntry) -> Result<Self, Self::Error> {
        let name = entry.name.trim();
        if name.is_empty() {
            return Err("name is empty".to_string());
        }

        let endpoint = entry.url.trim();
        let url = Url::parse(endpoint).map_err(|e| format!("invalid url: {e}"))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err("url has no host".to_string());
        }

        let protocol = match entry.protocol.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p
                .to_ascii_lowercase()
                .parse::<Protocol>()
                .map_err(|_| format!("unknown protocol '{p}'"))?,
            _ => Protocol::from_scheme(url.scheme())
                .ok_or_else(|| format!("cannot infer protocol from scheme '{}'", url.scheme()))?,
        };
        if !protocol.accepts_scheme(url.scheme()) {
            return Err(format!(
                "scheme '{}' does not match protocol {protocol}",
                url.scheme()
            ));
        }

        Ok(Self {
            name: name.to_string(),
            protocol,
            endpoint: endpoint.to_string(),
            enabled: entry.enabled,
        })
    }
}
