//! Circuit breaker over aggregate fetch failures.
//!
//! ```text
//! Closed   -> Open:     failure_threshold consecutive failures
//! Open     -> HalfOpen: recovery_timeout elapsed since the last failure
//! HalfOpen -> Closed:   next success (failure count reset)
//! HalfOpen -> Open:     next failure
//! ```
//!
//! The breaker only mutates state. Transitions are returned from the mutating
//! calls and published on a broadcast channel; logging them is up to the caller.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// State transition observed on a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEvent {
    Opened { consecutive_failures: u32 },
    HalfOpened,
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
            events,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Receive every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: BreakerEvent) -> BreakerEvent {
        // No subscribers is fine.
        let _ = self.events.send(event);
        event
    }

    /// Move Open -> HalfOpen once the cooldown has elapsed.
    fn poll(&self, inner: &mut Inner) -> Option<BreakerEvent> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let cooled = inner
            .last_failure_at
            .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
        if !cooled {
            return None;
        }
        inner.state = CircuitState::HalfOpen;
        Some(self.publish(BreakerEvent::HalfOpened))
    }

    /// Current state, applying a pending Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.poll(&mut inner);
        inner.state
    }

    /// Apply a pending Open -> HalfOpen transition and return it, so callers
    /// that log transitions see it.
    pub fn refresh(&self) -> Option<BreakerEvent> {
        let mut inner = self.lock();
        self.poll(&mut inner)
    }

    /// False while the circuit is open and the cooldown has not elapsed.
    pub fn allows_retry(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Record a failed request. Returns the transition it caused, if any.
    pub fn record_failure(&self) -> Option<BreakerEvent> {
        let mut inner = self.lock();
        let polled = self.poll(&mut inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());
        let opens = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if opens {
            inner.state = CircuitState::Open;
            return Some(self.publish(BreakerEvent::Opened {
                consecutive_failures: inner.consecutive_failures,
            }));
        }
        polled
    }

    /// Record a successful request. Closes a half-open circuit; resets the
    /// consecutive-failure count unless the circuit is still open.
    pub fn record_success(&self) -> Option<BreakerEvent> {
        let mut inner = self.lock();
        let polled = self.poll(&mut inner);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                Some(self.publish(BreakerEvent::Closed))
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                polled
            }
            CircuitState::Open => polled,
        }
    }
}
