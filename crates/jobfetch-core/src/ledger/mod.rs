//! Per-identifier failure bookkeeping.
//!
//! The ledger holds the latest terminal outcome for every identifier a run has
//! resolved: a [`FailureRecord`] while it is failed, membership in the
//! successful set once it succeeds. It is shared by every in-flight fetch of a
//! run, so all state sits behind one mutex and no operation can fail.

mod persist;
mod snapshot;


use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use snapshot::PersistedLedger;

/// Last known failure of one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: String,
    /// Attempts made in the pass that recorded this failure.
    pub attempts: u32,
    pub last_error: String,
    #[serde(default)]
    pub last_status_code: Option<u16>,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStats {
    pub successful_count: usize,
    pub failed_count: usize,
    /// Percent of resolved identifiers that succeeded (0 when nothing resolved).
    pub success_rate: f64,
    /// Failures recorded over the ledger's lifetime, including recovered ones.
    pub total_errors: u64,
    pub errors_by_status: BTreeMap<u16, u64>,
}

#[derive(Debug, Default)]
struct State {
    failures: HashMap<String, FailureRecord>,
    successful: HashSet<String>,
    total_errors: u64,
    errors_by_status: BTreeMap<u16, u64>,
}

#[derive(Debug, Default)]
pub struct FailureLedger {
    state: Mutex<State>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a terminal failure. Keeps the first-failure time of an existing
    /// record and moves `id` out of the successful set.
    pub fn record_failure(
        &self,
        id: &str,
        error: &str,
        status_code: Option<u16>,
        attempts: u32,
    ) {
        let now = Utc::now();
        let mut state = self.lock();
        state.successful.remove(id);
        state.total_errors += 1;
        if let Some(code) = status_code {
            *state.errors_by_status.entry(code).or_insert(0) += 1;
        }
        let first_failed_at = state
            .failures
            .get(id)
            .map_or(now, |existing| existing.first_failed_at);
        state.failures.insert(
            id.to_string(),
            FailureRecord {
                id: id.to_string(),
                attempts,
                last_error: error.to_string(),
                last_status_code: status_code,
                first_failed_at,
                last_failed_at: now,
            },
        );
    }

    /// Mark `id` successful, dropping any failure record. Idempotent.
    pub fn record_success(&self, id: &str) {
        let mut state = self.lock();
        state.failures.remove(id);
        if !state.successful.contains(id) {
            state.successful.insert(id.to_string());
        }
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.lock().failures.contains_key(id)
    }

    pub fn is_successful(&self, id: &str) -> bool {
        self.lock().successful.contains(id)
    }

    /// Currently failed identifiers, sorted.
    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().failures.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn failure(&self, id: &str) -> Option<FailureRecord> {
        self.lock().failures.get(id).cloned()
    }

    /// Every current failure record, sorted by identifier.
    pub fn failures(&self) -> Vec<FailureRecord> {
        let mut records: Vec<FailureRecord> = self.lock().failures.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn statistics(&self) -> LedgerStats {
        let state = self.lock();
        let successful_count = state.successful.len();
        let failed_count = state.failures.len();
        let resolved = successful_count + failed_count;
        let success_rate = if resolved == 0 {
            0.0
        } else {
            successful_count as f64 / resolved as f64 * 100.0
        };
        LedgerStats {
            successful_count,
            failed_count,
            success_rate,
            total_errors: state.total_errors,
            errors_by_status: state.errors_by_status.clone(),
        }
    }

    pub fn snapshot(&self) -> PersistedLedger {
        snapshot::to_snapshot(&self.lock())
    }

    pub fn from_snapshot(snapshot: PersistedLedger) -> Self {
        Self {
            state: Mutex::new(snapshot::from_snapshot(snapshot)),
        }
    }
}
