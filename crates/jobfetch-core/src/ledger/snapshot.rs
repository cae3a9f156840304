//! Serializable snapshot of a FailureLedger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FailureRecord, State};

/// Ledger contents as written to `failed_ids.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedLedger {
    #[serde(default = "default_version")]
    pub version: u8,
    pub saved_at: DateTime<Utc>,
    /// Sorted.
    #[serde(default)]
    pub successful: Vec<String>,
    /// Sorted by identifier.
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    #[serde(default)]
    pub total_errors: u64,
    #[serde(default)]
    pub errors_by_status: BTreeMap<u16, u64>,
}

fn default_version() -> u8 {
    1
}

impl PersistedLedger {
    /// Identifiers that were still failed when the snapshot was taken.
    pub fn failed_ids(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.id.clone()).collect()
    }
}

pub(super) fn to_snapshot(state: &State) -> PersistedLedger {
    let mut successful: Vec<String> = state.successful.iter().cloned().collect();
    successful.sort();
    let mut failures: Vec<FailureRecord> = state.failures.values().cloned().collect();
    failures.sort_by(|a, b| a.id.cmp(&b.id));
    PersistedLedger {
        version: 1,
        saved_at: Utc::now(),
        successful,
        failures,
        total_errors: state.total_errors,
        errors_by_status: state.errors_by_status.clone(),
    }
}

/// A record also listed as successful is dropped; the success is newer.
pub(super) fn from_snapshot(snapshot: PersistedLedger) -> State {
    let successful: std::collections::HashSet<String> = snapshot.successful.into_iter().collect();
    let failures = snapshot
        .failures
        .into_iter()
        .filter(|f| !successful.contains(&f.id))
        .map(|f| (f.id.clone(), f))
        .collect();
    State {
        failures,
        successful,
        total_errors: snapshot.total_errors,
        errors_by_status: snapshot.errors_by_status,
    }
}
