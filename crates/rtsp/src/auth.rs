//! `WWW-Authenticate` challenges and `Authorization` header generation.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use md5::{Digest, Md5};

use crate::{Result, RtspError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: Option<String>,
    },
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
        /// Set when the server offers `qop=auth`.
        qop_auth: bool,
    },
}

impl Challenge {
    /// Parse a single `WWW-Authenticate` header value.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
        let params = parse_params(rest);
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };

        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(Challenge::Basic {
                realm: get("realm"),
            });
        }
        if scheme.eq_ignore_ascii_case("digest") {
            if let Some(algorithm) = get("algorithm")
                && !algorithm.eq_ignore_ascii_case("md5")
            {
                return Err(RtspError::UnsupportedAuth(format!("digest algorithm {algorithm}")));
            }
            let realm = get("realm").unwrap_or_default();
            let nonce = get("nonce")
                .ok_or_else(|| RtspError::Malformed("digest challenge without nonce".to_string()))?;
            let qop_auth = get("qop")
                .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
                .unwrap_or(false);
            return Ok(Challenge::Digest {
                realm,
                nonce,
                opaque: get("opaque"),
                qop_auth,
            });
        }
        Err(RtspError::UnsupportedAuth(scheme.to_string()))
    }

    /// Pick the strongest supported challenge, preferring Digest over Basic.
    pub fn select<'a>(values: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut basic = None;
        let mut last_err = None;
        for value in values {
            match Challenge::parse(value) {
                Ok(c @ Challenge::Digest { .. }) => return Ok(c),
                Ok(c @ Challenge::Basic { .. }) => basic = Some(c),
                Err(e) => last_err = Some(e),
            }
        }
        basic.ok_or_else(|| {
            last_err.unwrap_or_else(|| RtspError::UnsupportedAuth("no challenge offered".to_string()))
        })
    }

    /// Build the `Authorization` header value for a request.
    ///
    /// `nc` is the nonce count; it only matters when `qop=auth` is in use.
    pub fn authorize(&self, creds: &Credentials, method: &str, uri: &str, nc: u32) -> String {
        match self {
            Challenge::Basic { .. } => {
                let token = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
                format!("Basic {token}")
            }
            Challenge::Digest {
                realm,
                nonce,
                opaque,
                qop_auth,
            } => {
                let ha1 = md5_hex(&format!("{}:{realm}:{}", creds.username, creds.password));
                let ha2 = md5_hex(&format!("{method}:{uri}"));
                let mut header = format!(
                    "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\"",
                    creds.username
                );
                if *qop_auth {
                    let cnonce = format!("{:016x}", rand::random::<u64>());
                    let nc = format!("{nc:08x}");
                    let response = md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));
                    header.push_str(&format!(
                        ", qop=auth, nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\""
                    ));
                } else {
                    let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
                    header.push_str(&format!(", response=\"{response}\""));
                }
                if let Some(opaque) = opaque {
                    header.push_str(&format!(", opaque=\"{opaque}\""));
                }
                header.push_str(", algorithm=MD5");
                header
            }
        }
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `k=v, k="v, with comma"` into pairs.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        out.push((key.trim().to_string(), value.trim().to_string()));
    }
    out
}
