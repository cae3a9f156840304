//! Classify observed status codes and fetch errors into retry error kinds.

use std::collections::BTreeSet;

use super::error::FetchError;

/// High-level classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failure, timeout, or a retryable status without a dedicated kind.
    Transient,
    /// Server asked us to slow down (429). Retried until the attempt budget runs out.
    RateLimited,
    /// Retryable access denial (403).
    Forbidden,
    /// Retryable server-side error (5xx).
    ServerError,
    /// Anything else; never retried.
    Terminal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Terminal)
    }
}

/// Classify an HTTP status code against the configured retryable set.
pub fn classify_status(code: u16, retryable: &BTreeSet<u16>) -> ErrorKind {
    if code == 429 {
        return ErrorKind::RateLimited;
    }
    if !retryable.contains(&code) {
        return ErrorKind::Terminal;
    }
    match code {
        403 => ErrorKind::Forbidden,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Transient,
    }
}

/// Classify a failed attempt from its last status code and error.
///
/// With neither known (or only a bare network/timeout error) the failure is
/// transient.
pub fn classify(
    status: Option<u16>,
    error: Option<&FetchError>,
    retryable: &BTreeSet<u16>,
) -> ErrorKind {
    match error {
        Some(FetchError::Other(_)) => return ErrorKind::Terminal,
        Some(FetchError::RateLimited { .. }) => return ErrorKind::RateLimited,
        _ => {}
    }
    let status = status.or_else(|| error.and_then(FetchError::status_code));
    match status {
        Some(code) => classify_status(code, retryable),
        None => ErrorKind::Transient,
    }
}
