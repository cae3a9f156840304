//! Bounded dispatcher.
//!
//! Resolves a batch of identifiers through a [`RecordFetcher`]: every
//! identifier gets its own retry loop, every network attempt holds one unit of
//! the shared [`ConcurrencyLimit`], and every terminal outcome lands in the
//! [`FailureLedger`].

mod counters;
mod limit;
mod progress;

pub use counters::{CounterSnapshot, RunCounters};
pub use limit::{ConcurrencyLimit, Permit};
pub use progress::DispatchProgress;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;

use crate::config::{secs, ConfigError, FetchConfig};
use crate::ledger::FailureLedger;
use crate::retry::{run_with_retry, AttemptOutcome, RetryPolicy};
use crate::source::RecordFetcher;

/// One successfully fetched record.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<P> {
    pub id: String,
    pub payload: P,
    /// Attempts it took in the pass that fetched it.
    pub attempts: u32,
}

#[derive(Debug)]
pub struct Dispatcher {
    policy: Arc<RetryPolicy>,
    ledger: Arc<FailureLedger>,
    limit: Arc<ConcurrencyLimit>,
    counters: Arc<RunCounters>,
    window_size: usize,
    window_delay: Duration,
    progress_tx: Option<mpsc::Sender<DispatchProgress>>,
}

impl Dispatcher {
    pub fn new(
        max_concurrent: usize,
        window_size: usize,
        policy: Arc<RetryPolicy>,
        ledger: Arc<FailureLedger>,
    ) -> Result<Self, ConfigError> {
        if window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(Self {
            policy,
            ledger,
            limit: Arc::new(ConcurrencyLimit::new(max_concurrent)?),
            counters: Arc::new(RunCounters::default()),
            window_size,
            window_delay: Duration::ZERO,
            progress_tx: None,
        })
    }

    /// Builds the retry policy from `cfg` and uses `ledger` for outcomes.
    pub fn from_config(cfg: &FetchConfig, ledger: Arc<FailureLedger>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let policy = Arc::new(RetryPolicy::from_config(&cfg.retry, &cfg.circuit_breaker)?);
        let dispatcher = Self::new(cfg.max_concurrent, cfg.window_size, policy, ledger)?
            .with_window_delay(secs("window_delay_secs", cfg.window_delay_secs)?);
        Ok(dispatcher)
    }

    /// Pause after each window's worth of identifiers is issued.
    pub fn with_window_delay(mut self, delay: Duration) -> Self {
        self.window_delay = delay;
        self
    }

    /// Send a [`DispatchProgress`] after every identifier resolves. Updates are
    /// dropped, not awaited, when the receiver lags.
    pub fn with_progress(mut self, tx: mpsc::Sender<DispatchProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<FailureLedger> {
        &self.ledger
    }

    pub fn limit(&self) -> &Arc<ConcurrencyLimit> {
        &self.limit
    }

    pub fn counters(&self) -> &Arc<RunCounters> {
        &self.counters
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Resolve every identifier in `ids`, returning the ones fetched.
    ///
    /// Failed identifiers are in the ledger afterwards; nothing here aborts
    /// the batch. At most `window_size` identifiers are being worked on at
    /// once; finished ones are replaced immediately.
    pub async fn dispatch<F>(&self, ids: Vec<String>, fetcher: Arc<F>) -> Vec<Fetched<F::Payload>>
    where
        F: RecordFetcher,
    {
        let total = ids.len();
        let started = Instant::now();
        let mut progress = DispatchProgress::new(total);
        let mut fetched = Vec::with_capacity(total);
        let mut queue = ids.into_iter().peekable();
        let mut join_set = JoinSet::new();
        let mut pending: HashMap<task::Id, String> = HashMap::new();
        let mut issued_in_window = 0usize;
        let mut window = 0usize;

        loop {
            while join_set.len() < self.window_size {
                if queue.peek().is_none() {
                    break;
                }
                if issued_in_window == self.window_size {
                    if !self.window_delay.is_zero() {
                        tokio::time::sleep(self.window_delay).await;
                    }
                    issued_in_window = 0;
                }
                if issued_in_window == 0 {
                    window += 1;
                    tracing::info!(
                        window,
                        issued = progress.completed + join_set.len(),
                        total,
                        "dispatching window"
                    );
                }
                let Some(id) = queue.next() else {
                    break;
                };
                let handle = join_set.spawn(resolve_one(
                    id.clone(),
                    Arc::clone(&fetcher),
                    Arc::clone(&self.policy),
                    Arc::clone(&self.limit),
                    Arc::clone(&self.counters),
                    Arc::clone(&self.ledger),
                ));
                pending.insert(handle.id(), id);
                issued_in_window += 1;
            }

            let Some(res) = join_set.join_next_with_id().await else {
                break;
            };
            match settle(res, &mut pending, &self.ledger) {
                Some(item) => {
                    progress.record(true, started.elapsed().as_secs_f64());
                    fetched.push(item);
                }
                None => progress.record(false, started.elapsed().as_secs_f64()),
            }
            if let Some(tx) = &self.progress_tx {
                let _ = tx.try_send(progress.clone());
            }
        }

        tracing::info!(
            total,
            succeeded = progress.succeeded,
            failed = progress.failed,
            elapsed_secs = progress.elapsed_secs,
            "dispatch finished"
        );
        fetched
    }
}

/// Take one finished task off `pending`. A task that died before reporting
/// (cancelled, or panicked outside the fetch) is a failure for its identifier.
fn settle<P>(
    res: Result<(task::Id, Option<Fetched<P>>), JoinError>,
    pending: &mut HashMap<task::Id, String>,
    ledger: &FailureLedger,
) -> Option<Fetched<P>> {
    match res {
        Ok((task_id, item)) => {
            pending.remove(&task_id);
            item
        }
        Err(e) => {
            let Some(id) = pending.remove(&e.id()) else {
                tracing::error!(error = %e, "dispatch task join for unknown task");
                return None;
            };
            tracing::error!(id = %id, error = %e, "dispatch task died");
            ledger.record_failure(&id, &format!("dispatch task failed: {}", e), None, 0);
            None
        }
    }
}

async fn resolve_one<F>(
    id: String,
    fetcher: Arc<F>,
    policy: Arc<RetryPolicy>,
    limit: Arc<ConcurrencyLimit>,
    counters: Arc<RunCounters>,
    ledger: Arc<FailureLedger>,
) -> Option<Fetched<F::Payload>>
where
    F: RecordFetcher,
{
    let outcome = run_with_retry(&id, &policy, &limit, &counters, || {
        let fetcher = Arc::clone(&fetcher);
        let id = id.clone();
        async move { fetcher.fetch_one(&id).await }
    })
    .await;

    match outcome {
        AttemptOutcome::Fetched { payload, attempts } => {
            ledger.record_success(&id);
            Some(Fetched {
                id,
                payload,
                attempts,
            })
        }
        AttemptOutcome::Failed { error, attempts } => {
            tracing::warn!(id = %id, attempts, error = %error, "giving up on identifier");
            ledger.record_failure(&id, &error.to_string(), error.status_code(), attempts);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FetchError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails ids listed in `fail_first` once with the given status, then succeeds.
    struct Flaky {
        fail_first: HashMap<String, u16>,
        calls: Mutex<HashMap<String, u32>>,
    }

    #[async_trait]
    impl RecordFetcher for Flaky {
        type Payload = String;

        async fn fetch_one(&self, id: &str) -> Result<String, FetchError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(id.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            match self.fail_first.get(id) {
                Some(&code) if n == 1 => Err(FetchError::status(code, "scripted")),
                _ => Ok(format!("record {id}")),
            }
        }
    }

    fn policy() -> Arc<RetryPolicy> {
        let cfg = crate::config::RetryConfig {
            strategy: "fixed".into(),
            max_attempts: 3,
            initial_delay_secs: 1.0,
            ..Default::default()
        };
        Arc::new(RetryPolicy::from_config(&cfg, &Default::default()).unwrap())
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = Dispatcher::new(4, 0, policy(), Arc::new(FailureLedger::new())).unwrap_err();
        assert_eq!(err, ConfigError::ZeroWindow);
    }

    #[tokio::test(start_paused = true)]
    async fn every_identifier_resolves_exactly_once() {
        let fetcher = Arc::new(Flaky {
            fail_first: [("3".to_string(), 500), ("7".to_string(), 404)].into(),
            calls: Mutex::new(HashMap::new()),
        });
        let ledger = Arc::new(FailureLedger::new());
        let d = Dispatcher::new(4, 5, policy(), Arc::clone(&ledger)).unwrap();

        let out = d.dispatch(ids(12), Arc::clone(&fetcher)).await;

        assert_eq!(out.len(), 11);
        assert_eq!(ledger.failed_ids(), vec!["7".to_string()]);
        for f in &out {
            assert_eq!(f.payload, format!("record {}", f.id));
            assert_eq!(f.attempts, if f.id == "3" { 2 } else { 1 });
        }
        assert_eq!(ledger.failure("7").unwrap().attempts, 1);
        assert_eq!(d.counters().attempts(), 13);
        assert_eq!(d.counters().errors(), 2);
        assert!(d.limit().peak() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_reported_per_identifier() {
        let fetcher = Arc::new(Flaky {
            fail_first: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        });
        let (tx, mut rx) = mpsc::channel(64);
        let d = Dispatcher::new(2, 2, policy(), Arc::new(FailureLedger::new()))
            .unwrap()
            .with_progress(tx);

        d.dispatch(ids(5), fetcher).await;
        drop(d);

        let mut last = None;
        while let Some(p) = rx.recv().await {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.completed, 5);
        assert_eq!(last.succeeded, 5);
        assert_eq!(last.fraction(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_delay_paces_issuing() {
        let fetcher = Arc::new(Flaky {
            fail_first: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        });
        let d = Dispatcher::new(10, 2, policy(), Arc::new(FailureLedger::new()))
            .unwrap()
            .with_window_delay(Duration::from_secs(1));
        let start = Instant::now();

        let out = d.dispatch(ids(6), fetcher).await;

        assert_eq!(out.len(), 6);
        // Three windows, two pauses between them.
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn dead_task_is_recorded_as_a_failure() {
        let ledger = FailureLedger::new();
        let mut join_set: JoinSet<Option<Fetched<String>>> = JoinSet::new();
        let mut pending = HashMap::new();
        async fn buggy_task() -> Option<Fetched<String>> {
            panic!("task bug")
        }
        let handle = join_set.spawn(buggy_task());
        pending.insert(handle.id(), "42".to_string());
        let handle = join_set.spawn(async {
            Some(Fetched {
                id: "43".to_string(),
                payload: "ok".to_string(),
                attempts: 1,
            })
        });
        pending.insert(handle.id(), "43".to_string());

        let mut fetched = Vec::new();
        while let Some(res) = join_set.join_next_with_id().await {
            fetched.extend(settle(res, &mut pending, &ledger));
        }

        assert!(pending.is_empty());
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, "43");
        assert_eq!(ledger.failed_ids(), vec!["42".to_string()]);
        assert!(ledger.failure("42").unwrap().last_error.starts_with("dispatch task failed"));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let fetcher = Arc::new(Flaky {
            fail_first: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
        });
        let d = Dispatcher::new(2, 2, policy(), Arc::new(FailureLedger::new())).unwrap();
        assert!(d.dispatch(Vec::new(), fetcher).await.is_empty());
        assert_eq!(d.counters().attempts(), 0);
    }
}
