//! Failure type returned by caller-supplied fetch operations.

use std::fmt;
use std::time::Duration;

/// Error returned by a single fetch (one identifier or one search page).
/// Callers map their HTTP client's failures into these variants so the retry
/// policy can classify them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Response had a non-success status.
    Status { code: u16, message: String },
    /// Server rejected the request for rate limiting (HTTP 429), optionally with a
    /// wait hint taken from `Retry-After`.
    RateLimited { retry_after: Option<Duration> },
    /// Request deadline elapsed.
    Timeout,
    /// Connection-level failure (reset, DNS, TLS, ...).
    Network(String),
    /// Anything else (decode failure, fetcher bug). Never retried.
    Other(String),
}

impl FetchError {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        FetchError::Status {
            code,
            message: message.into(),
        }
    }

    /// Status code observed on the wire, if any. Rate limiting reports 429.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::Status { code, .. } => Some(*code),
            FetchError::RateLimited { .. } => Some(429),
            FetchError::Timeout | FetchError::Network(_) | FetchError::Other(_) => None,
        }
    }

    /// Server-suggested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status { code, message } if message.is_empty() => write!(f, "HTTP {}", code),
            FetchError::Status { code, message } => write!(f, "HTTP {}: {}", code, message),
            FetchError::RateLimited {
                retry_after: Some(d),
            } => write!(f, "rate limited (retry after {}s)", d.as_secs_f64()),
            FetchError::RateLimited { retry_after: None } => write!(f, "rate limited"),
            FetchError::Timeout => write!(f, "request timed out"),
            FetchError::Network(msg) => write!(f, "network: {}", msg),
            FetchError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_and_hint() {
        assert_eq!(FetchError::status(404, "not found").status_code(), Some(404));
        let limited = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(limited.status_code(), Some(429));
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(FetchError::Timeout.status_code(), None);
        assert_eq!(FetchError::Timeout.retry_after(), None);
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(FetchError::status(503, "").to_string(), "HTTP 503");
        assert_eq!(
            FetchError::status(403, "forbidden").to_string(),
            "HTTP 403: forbidden"
        );
        assert_eq!(
            FetchError::Network("connection reset".into()).to_string(),
            "network: connection reset"
        );
    }
}
