//! Two-pass fetch pipeline.
//!
//! Pass 1 dispatches the whole batch. Whatever is still failed afterwards gets
//! one more pass, after a settle delay, with a fresh retry budget. Failures
//! that survive both passes are reported in the result, never raised.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{secs, ConfigError, FetchConfig};
use crate::dispatch::{Dispatcher, Fetched};
use crate::ledger::{FailureLedger, FailureRecord};
use crate::source::RecordFetcher;

/// Aggregate counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub total_attempts: u64,
    pub total_errors: u64,
    pub successful: usize,
    pub failed: usize,
    /// Percent of identifiers fetched (0 for an empty batch).
    pub success_rate: f64,
}

#[derive(Debug)]
pub struct FetchResult<P> {
    pub fetched: Vec<Fetched<P>>,
    /// Identifiers not recovered by either pass, sorted by identifier.
    pub failed: Vec<FailureRecord>,
    pub stats: RunStats,
}

impl<P> FetchResult<P> {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }
}

#[derive(Debug)]
pub struct FetchPipeline {
    dispatcher: Dispatcher,
    settle_delay: Duration,
    ledger_path: Option<PathBuf>,
}

impl FetchPipeline {
    /// Pipeline with a fresh ledger, configured from `cfg`.
    pub fn new(cfg: &FetchConfig) -> Result<Self, ConfigError> {
        Self::with_ledger(cfg, Arc::new(FailureLedger::new()))
    }

    /// Pipeline recording into an existing ledger, e.g. one loaded from disk.
    pub fn with_ledger(cfg: &FetchConfig, ledger: Arc<FailureLedger>) -> Result<Self, ConfigError> {
        let dispatcher = Dispatcher::from_config(cfg, ledger)?;
        Ok(Self {
            dispatcher,
            settle_delay: secs("settle_delay_secs", cfg.settle_delay_secs)?,
            ledger_path: cfg.ledger_path.clone(),
        })
    }

    pub fn from_parts(dispatcher: Dispatcher, settle_delay: Duration) -> Self {
        Self {
            dispatcher,
            settle_delay,
            ledger_path: None,
        }
    }

    /// Save the ledger to `path` after each pass.
    pub fn with_ledger_path(mut self, path: PathBuf) -> Self {
        self.ledger_path = Some(path);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Arc<FailureLedger> {
        self.dispatcher.ledger()
    }

    /// Fetch every identifier in `ids`. Duplicates are collapsed, first
    /// occurrence wins. Each identifier ends up in exactly one of
    /// `fetched` and `failed`.
    pub async fn run<F, I, S>(&self, ids: I, fetcher: Arc<F>) -> FetchResult<F::Payload>
    where
        F: RecordFetcher,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids = dedupe(ids);
        let before = self.dispatcher.counters().snapshot();
        let ledger = self.ledger();

        tracing::info!(identifiers = ids.len(), "main pass");
        let mut fetched = self.dispatcher.dispatch(ids.clone(), Arc::clone(&fetcher)).await;
        self.persist_ledger();

        let retry_ids: Vec<String> = ids.iter().filter(|id| ledger.is_failed(id)).cloned().collect();
        if !retry_ids.is_empty() {
            tracing::info!(
                identifiers = retry_ids.len(),
                settle_ms = self.settle_delay.as_millis() as u64,
                "re-driving failed identifiers"
            );
            tokio::time::sleep(self.settle_delay).await;
            fetched.extend(self.dispatcher.dispatch(retry_ids, fetcher).await);
            self.persist_ledger();
        }

        let failed: Vec<FailureRecord> = {
            let mut records: Vec<FailureRecord> = ids.iter().filter_map(|id| ledger.failure(id)).collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            records
        };
        let counts = self.dispatcher.counters().snapshot().since(before);
        let resolved = fetched.len() + failed.len();
        let stats = RunStats {
            total_attempts: counts.attempts,
            total_errors: counts.errors,
            successful: fetched.len(),
            failed: failed.len(),
            success_rate: if resolved == 0 {
                0.0
            } else {
                fetched.len() as f64 / resolved as f64 * 100.0
            },
        };
        tracing::info!(
            successful = stats.successful,
            failed = stats.failed,
            attempts = stats.total_attempts,
            success_rate = stats.success_rate,
            "pipeline finished"
        );
        FetchResult {
            fetched,
            failed,
            stats,
        }
    }

    fn persist_ledger(&self) {
        let Some(path) = &self.ledger_path else {
            return;
        };
        if let Err(e) = self.ledger().save_to_path(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not save failure ledger");
        }
    }
}

fn dedupe<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(Into::into)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        assert_eq!(dedupe(["b", "a", "b", "c", "a"]), vec!["b", "a", "c"]);
        assert!(dedupe(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn new_rejects_invalid_config() {
        let cfg = FetchConfig {
            max_concurrent: 0,
            ..FetchConfig::default()
        };
        assert_eq!(
            FetchPipeline::new(&cfg).unwrap_err(),
            ConfigError::ZeroConcurrency
        );
    }
}
