//! Retry loop: run a fetch until it succeeds or the policy says stop.

use std::future::Future;

use crate::breaker::BreakerEvent;
use crate::dispatch::{ConcurrencyLimit, RunCounters};

use super::context::AttemptContext;
use super::error::FetchError;
use super::policy::{RetryDecision, RetryPolicy};

/// Terminal result of the retry loop for one key.
#[derive(Debug)]
pub enum AttemptOutcome<P> {
    Fetched { payload: P, attempts: u32 },
    Failed { error: FetchError, attempts: u32 },
}

pub(crate) fn log_breaker_event(event: Option<BreakerEvent>) {
    match event {
        Some(BreakerEvent::Opened {
            consecutive_failures,
        }) => tracing::warn!(consecutive_failures, "circuit opened; retries suspended"),
        Some(BreakerEvent::HalfOpened) => tracing::info!("circuit half-open; next request tests upstream"),
        Some(BreakerEvent::Closed) => tracing::info!("circuit closed; upstream recovered"),
        None => {}
    }
}

/// Runs `op` until it succeeds or the retry policy says to stop.
///
/// Each attempt holds one unit of `limit` only while the operation is in
/// flight; backoff waits release it. The operation runs in its own task so a
/// panicking fetcher becomes a terminal failure for `key` instead of tearing
/// down the batch. A rate-limit wait hint replaces the policy's delay when the
/// policy honors hints.
pub async fn run_with_retry<P, F, Fut>(
    key: &str,
    policy: &RetryPolicy,
    limit: &ConcurrencyLimit,
    counters: &RunCounters,
    mut op: F,
) -> AttemptOutcome<P>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<P, FetchError>> + Send + 'static,
    P: Send + 'static,
{
    let mut attempt = 1u32;
    loop {
        log_breaker_event(policy.poll_breaker());
        let result = match limit.acquire().await {
            Ok(_permit) => {
                counters.record_attempt();
                match tokio::spawn(op()).await {
                    Ok(res) => res,
                    Err(e) => Err(FetchError::Other(format!("fetch task failed: {}", e))),
                }
            }
            Err(_) => Err(FetchError::Other("concurrency limit closed".to_string())),
        };

        let error = match result {
            Ok(payload) => {
                log_breaker_event(policy.on_success());
                return AttemptOutcome::Fetched {
                    payload,
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        counters.record_error();
        log_breaker_event(policy.on_failure());

        let hint = error
            .retry_after()
            .filter(|_| policy.rules().honor_retry_after);
        let ctx = AttemptContext::failed(key, attempt, error.clone());
        log_breaker_event(policy.poll_breaker());
        match policy.decide(&ctx) {
            RetryDecision::NoRetry => {
                tracing::debug!(key, attempt, error = %error, "giving up");
                return AttemptOutcome::Failed {
                    error,
                    attempts: attempt,
                };
            }
            RetryDecision::RetryAfter(delay) => {
                let wait = hint.unwrap_or(delay);
                tracing::debug!(
                    key,
                    attempt,
                    error = %error,
                    wait_ms = wait.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn fixed_policy(max_attempts: u32, delay_secs: f64) -> RetryPolicy {
        let cfg = RetryConfig {
            strategy: "fixed".into(),
            max_attempts,
            initial_delay_secs: delay_secs,
            ..RetryConfig::default()
        };
        RetryPolicy::from_config(&cfg, &CircuitBreakerConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = fixed_policy(3, 1.0);
        let limit = ConcurrencyLimit::new(1).unwrap();
        let counters = RunCounters::default();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = run_with_retry("42", &policy, &limit, &counters, || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FetchError::status(500, ""))
                } else {
                    Ok("payload")
                }
            }
        })
        .await;

        assert!(matches!(
            outcome,
            AttemptOutcome::Fetched {
                payload: "payload",
                attempts: 2
            }
        ));
        assert_eq!(counters.attempts(), 2);
        assert_eq!(counters.errors(), 1);
        assert_eq!(limit.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts() {
        let policy = fixed_policy(3, 1.0);
        let limit = ConcurrencyLimit::new(1).unwrap();
        let counters = RunCounters::default();

        let outcome: AttemptOutcome<()> =
            run_with_retry("42", &policy, &limit, &counters, || async {
                Err(FetchError::Timeout)
            })
            .await;

        match outcome {
            AttemptOutcome::Failed { error, attempts } => {
                assert_eq!(error, FetchError::Timeout);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(counters.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_replaces_policy_delay() {
        let policy = fixed_policy(2, 30.0);
        let limit = ConcurrencyLimit::new(1).unwrap();
        let counters = RunCounters::default();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let outcome = run_with_retry("7", &policy, &limit, &counters, || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FetchError::RateLimited {
                        retry_after: Some(Duration::from_secs(3)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(matches!(outcome, AttemptOutcome::Fetched { attempts: 2, .. }));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3), "waited {waited:?}");
        assert!(waited < Duration::from_secs(30), "waited {waited:?}");
    }

    #[tokio::test]
    async fn panicking_fetch_is_a_terminal_failure() {
        let policy = fixed_policy(3, 0.0);
        let limit = ConcurrencyLimit::new(1).unwrap();
        let counters = RunCounters::default();

        async fn buggy_fetch() -> Result<(), FetchError> {
            panic!("fetcher bug")
        }

        let outcome = run_with_retry("boom", &policy, &limit, &counters, buggy_fetch).await;

        assert!(matches!(
            outcome,
            AttemptOutcome::Failed {
                error: FetchError::Other(_),
                attempts: 1
            }
        ));
        assert_eq!(limit.in_flight(), 0);
    }
}
