//! Progress reporting for a dispatch run (identifiers done, rate, ETA).
//!
//! Sent on an optional channel after every identifier resolves; consumers can
//! render a bar from `fraction()` and `eta_secs()`.

/// Snapshot of one dispatch run.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchProgress {
    /// Identifiers resolved so far (fetched or failed).
    pub completed: usize,
    /// Identifiers in this run.
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Seconds since the run started.
    pub elapsed_secs: f64,
}

impl DispatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: 0,
            total,
            succeeded: 0,
            failed: 0,
            elapsed_secs: 0.0,
        }
    }

    /// Identifiers resolved per second (0 if elapsed is 0).
    pub fn per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.completed as f64 / self.elapsed_secs
    }

    /// Estimated seconds remaining (None if rate is 0 and work remains).
    pub fn eta_secs(&self) -> Option<f64> {
        let remaining = self.total.saturating_sub(self.completed);
        if remaining == 0 {
            return Some(0.0);
        }
        let rate = self.per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }

    /// Fraction complete in [0.0, 1.0].
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }

    pub(crate) fn record(&mut self, fetched: bool, elapsed_secs: f64) {
        self.completed += 1;
        if fetched {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.elapsed_secs = elapsed_secs;
    }
}
