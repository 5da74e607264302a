//! Proxy representation and status.

use std::fmt;
use std::time::{Duration, Instant};

/// Upper bound on a rotating record's lease.
pub const MAX_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + after`, saturating at `now` when the sum is not representable.
pub(crate) fn later(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or(now)
}

/// Where a proxy record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxySource {
    /// Supplied up front by the caller; never expires.
    Static,
    /// Issued by the rotation service with a bounded lease.
    Rotating,
}

/// Health status of a proxy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// The proxy can be selected.
    Active,
    /// Temporarily or permanently out of rotation, but still held by the pool.
    Inactive,
    /// Terminal. The record is never selected again and is purged.
    Blacklisted,
}

/// A forwarding credential and its usage bookkeeping.
#[derive(Clone)]
pub struct ProxyRecord {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub source: ProxySource,
    pub status: ProxyStatus,
    pub added_at: Instant,
    /// Lease end for rotating records.
    pub expires_at: Option<Instant>,
    /// Reactivation time for a soft-disabled static record.
    pub inactive_until: Option<Instant>,
    pub last_used: Option<Instant>,
    pub use_count: usize,
    pub error_count: usize,
    pub rate_limit_count: usize,
    /// Rotation key that issued this record, if any.
    pub rotation_key: Option<String>,
}

impl ProxyRecord {
    /// Create a static record.
    pub fn new_static(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            source: ProxySource::Static,
            status: ProxyStatus::Active,
            added_at: Instant::now(),
            expires_at: None,
            inactive_until: None,
            last_used: None,
            use_count: 0,
            error_count: 0,
            rate_limit_count: 0,
            rotation_key: None,
        }
    }

    /// Create a rotating record whose lease ends `lease` from now.
    ///
    /// Leases longer than a day are cut to one day.
    pub fn new_rotating(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        lease: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            source: ProxySource::Rotating,
            added_at: now,
            expires_at: Some(later(now, lease.min(MAX_LEASE))),
            ..Self::new_static(host, port, username, password)
        }
    }

    /// Tag the record with the rotation key that issued it.
    pub fn with_rotation_key(mut self, key: impl Into<String>) -> Self {
        self.rotation_key = Some(key.into());
        self
    }

    /// Identity of the record inside the pool.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host, port and both credentials must be present.
    pub fn is_well_formed(&self) -> bool {
        !self.host.trim().is_empty()
            && self.port != 0
            && !self.username.is_empty()
            && !self.password.is_empty()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Convert the record to a reqwest proxy with basic auth.
    pub fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        Ok(reqwest::Proxy::all(format!("http://{}:{}", self.host, self.port))?
            .basic_auth(&self.username, &self.password))
    }
}

impl fmt::Debug for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRecord")
            .field("key", &self.key())
            .field("username", &self.username)
            .field("source", &self.source)
            .field("status", &self.status)
            .field("use_count", &self.use_count)
            .field("error_count", &self.error_count)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
