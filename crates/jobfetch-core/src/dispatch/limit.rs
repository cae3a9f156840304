//! Concurrency ceiling shared by every in-flight fetch.
//!
//! The dispatcher and the search driver acquire one permit per network
//! operation, so total concurrency stays under `max_concurrent` no matter how
//! many identifiers or pages are queued.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

use crate::config::ConfigError;

#[derive(Debug)]
pub struct ConcurrencyLimit {
    max: usize,
    semaphore: Semaphore,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyLimit {
    pub fn new(max: usize) -> Result<Self, ConfigError> {
        if max == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self {
            max,
            semaphore: Semaphore::new(max),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Free permits. May be 0 while every slot is busy.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Highest `in_flight` observed since construction.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Wait for a free slot. The slot is returned when the permit drops.
    pub async fn acquire(&self) -> Result<Permit<'_>, AcquireError> {
        let permit = self.semaphore.acquire().await?;
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(Permit {
            _permit: permit,
            limit: self,
        })
    }
}

/// One reserved slot of a [`ConcurrencyLimit`].
#[derive(Debug)]
pub struct Permit<'a> {
    _permit: SemaphorePermit<'a>,
    limit: &'a ConcurrencyLimit,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limit.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
