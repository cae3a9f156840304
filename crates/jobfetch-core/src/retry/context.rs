use tokio::time::Instant;

use super::error::FetchError;

/// Snapshot of one failed attempt, handed to the retry policy.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub id: String,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<FetchError>,
    pub timestamp: Instant,
}

impl AttemptContext {
    pub fn new(id: impl Into<String>, attempt: u32) -> Self {
        Self {
            id: id.into(),
            attempt,
            last_status_code: None,
            last_error: None,
            timestamp: Instant::now(),
        }
    }

    /// Context for an attempt that failed with `error`; the status code is taken from it.
    pub fn failed(id: impl Into<String>, attempt: u32, error: FetchError) -> Self {
        Self {
            id: id.into(),
            attempt,
            last_status_code: error.status_code(),
            last_error: Some(error),
            timestamp: Instant::now(),
        }
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.last_status_code = Some(code);
        self
    }
}
