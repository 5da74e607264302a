//! Parsing helpers for proxy lists and rotation responses.

use crate::error::RotationError;
use crate::proxy::{ProxyRecord, MAX_LEASE};

use log::warn;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

/// Rotation API status for a freshly issued proxy.
const STATUS_ISSUED: i64 = 100;
/// Rotation API status asking the caller to wait.
const STATUS_COOL_DOWN: i64 = 101;

/// Endpoint and credentials of a proxy issued by the rotation API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedProxy {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Lease stated by the endpoint, if any.
    pub lease: Option<Duration>,
}

/// Decoded answer of the rotation endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationResponse {
    Issued(IssuedProxy),
    /// The key must wait before rotating again.
    CoolDown(Option<Duration>),
    /// The key does not exist or has expired.
    InvalidKey(String),
}

#[derive(Deserialize)]
struct RawRotationResponse {
    status: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    proxyhttp: Option<String>,
}

/// Split a `host:port:user:pass` line.
pub(crate) fn parse_proxy_line(line: &str) -> Option<(String, u16, String, String)> {
    let mut parts = line.trim().splitn(4, ':');
    let host = parts.next()?.trim();
    let port = parts.next()?.trim().parse::<u16>().ok()?;
    let username = parts.next()?.trim();
    let password = parts.next()?.trim();
    if host.is_empty() || port == 0 || username.is_empty() || password.is_empty() {
        return None;
    }
    Some((host.to_string(), port, username.to_string(), password.to_string()))
}

/// Parse a static proxy list, one `host:port:user:pass` entry per line.
/// Blank lines and `#` comments are ignored.
pub fn parse_proxy_list(content: &str) -> Vec<ProxyRecord> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match parse_proxy_line(line) {
            Some((host, port, username, password)) => {
                Some(ProxyRecord::new_static(host, port, username, password))
            }
            None => {
                warn!("Ignoring malformed proxy line: {}", line);
                None
            }
        })
        .collect()
}

static SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)s").expect("seconds pattern is valid"));

/// First `<digits>s` figure in a message, e.g. `"expires in 780s"`.
///
/// `Ok(None)` when the message has no figure. Figures above
/// [`MAX_LEASE`] are malformed.
fn seconds_in(message: &str) -> Result<Option<Duration>, RotationError> {
    let Some(caps) = SECONDS.captures(message) else {
        return Ok(None);
    };
    let secs = caps[1]
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
        .filter(|d| *d <= MAX_LEASE)
        .ok_or_else(|| {
            RotationError::Malformed(format!("unreasonable duration: {}", truncate(message, 200)))
        })?;
    Ok(Some(secs))
}

/// Decode a rotation endpoint body.
pub(crate) fn parse_rotation_response(body: &str) -> Result<RotationResponse, RotationError> {
    let raw: RawRotationResponse = serde_json::from_str(body.trim())
        .map_err(|e| RotationError::Malformed(format!("{e}: {}", truncate(body, 200))))?;

    match raw.status {
        STATUS_ISSUED => {
            let line = raw
                .proxyhttp
                .ok_or_else(|| RotationError::Malformed("issued response without proxy".into()))?;
            let (host, port, username, password) = parse_proxy_line(&line)
                .ok_or_else(|| RotationError::Malformed(format!("bad proxy field: {line}")))?;
            Ok(RotationResponse::Issued(IssuedProxy {
                host,
                port,
                username,
                password,
                lease: seconds_in(&raw.message)?,
            }))
        }
        STATUS_COOL_DOWN => Ok(RotationResponse::CoolDown(seconds_in(&raw.message)?)),
        _ => Ok(RotationResponse::InvalidKey(raw.message)),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
