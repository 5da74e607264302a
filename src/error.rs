//! Error types for the proxy-task-pool crate.

use http::StatusCode;
use thiserror::Error;

/// Error returned when no usable proxy is available in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Classification of a failed task attempt.
///
/// Work functions report expected failures (network errors, non-2xx
/// responses, bad payloads) as one of these values instead of panicking.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorClass {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("timed out")]
    Timeout,
    #[error("proxy tunnel failure")]
    ProxyTunnel,
    /// HTTP 407 or an equivalent proxy authentication rejection.
    #[error("proxy authentication failed")]
    ProxyAuth,
    #[error("HTTP status {0}")]
    Http(u16),
    /// The task payload itself is unusable; never retried.
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
    #[error("no proxy available")]
    NoProxyAvailable,
    #[error("work function panicked")]
    Panicked,
    #[error("{0}")]
    Other(String),
}

impl ErrorClass {
    /// Map an HTTP status to an error class.
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            ErrorClass::ProxyAuth
        } else {
            ErrorClass::Http(status.as_u16())
        }
    }

    /// Classify a reqwest error by its kind and its source chain.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        if err.is_timeout() {
            return ErrorClass::Timeout;
        }

        let chain = error_chain_text(err);
        if chain.contains("407") || chain.contains("proxy authentication") {
            ErrorClass::ProxyAuth
        } else if chain.contains("tunnel") || chain.contains("socks") {
            ErrorClass::ProxyTunnel
        } else if chain.contains("reset") || chain.contains("broken pipe") {
            ErrorClass::ConnectionReset
        } else if chain.contains("timed out") {
            ErrorClass::Timeout
        } else if err.is_connect() || chain.contains("refused") {
            ErrorClass::ConnectionRefused
        } else {
            ErrorClass::Other(err.to_string())
        }
    }

    /// Transient failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorClass::ConnectionRefused
            | ErrorClass::ConnectionReset
            | ErrorClass::Timeout
            | ErrorClass::ProxyTunnel => true,
            ErrorClass::Http(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ErrorClass::ProxyAuth)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ErrorClass::Http(429))
    }

    /// Whether the failure is plausibly caused by the proxy the attempt used,
    /// and should therefore count against that proxy.
    pub fn is_proxy_related(&self) -> bool {
        matches!(
            self,
            ErrorClass::ConnectionRefused
                | ErrorClass::ConnectionReset
                | ErrorClass::Timeout
                | ErrorClass::ProxyTunnel
                | ErrorClass::ProxyAuth
                | ErrorClass::Http(429)
        )
    }
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string().to_lowercase();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }
    text
}

/// Errors raised synchronously by the task executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(String),
    #[error("executor is already running a batch")]
    AlreadyRunning,
}

/// Errors from a single rotation request.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("rotation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed rotation response: {0}")]
    Malformed(String),
    #[error("unknown rotation key: {0}")]
    UnknownKey(String),
    #[error("invalid rotation endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
