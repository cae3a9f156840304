use std::sync::atomic::{AtomicU64, Ordering};

/// Attempt and error totals, updated from every in-flight fetch.
#[derive(Debug, Default)]
pub struct RunCounters {
    attempts: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`RunCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub attempts: u64,
    pub errors: u64,
}

impl CounterSnapshot {
    /// Counts accumulated since `earlier`.
    pub fn since(self, earlier: CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            attempts: self.attempts.saturating_sub(earlier.attempts),
            errors: self.errors.saturating_sub(earlier.errors),
        }
    }
}

impl RunCounters {
    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            attempts: self.attempts(),
            errors: self.errors(),
        }
    }
}
