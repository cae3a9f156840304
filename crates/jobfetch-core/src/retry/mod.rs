//! Retry and backoff policy.
//!
//! This module encapsulates error classification (timeouts, throttling,
//! access denial, server errors) and the backoff strategies so that the
//! dispatcher and the search driver share one retry loop and one policy.

mod backoff;
mod classify;
mod context;
mod error;
mod policy;
mod run;

pub use backoff::{
    exponential_delay, AdaptiveBackoff, ExponentialBackoff, FibonacciBackoff, FixedBackoff,
    JitteredBackoff,
};
pub use classify::{classify, classify_status, ErrorKind};
pub use context::AttemptContext;
pub use error::FetchError;
pub use policy::{BreakerBackoff, RetryDecision, RetryPolicy, RetryRules, StrategyKind};
pub use run::{run_with_retry, AttemptOutcome};

pub(crate) use run::log_breaker_event;
