//! Persist the FailureLedger to disk (JSON under XDG state dir) so a later run
//! can re-drive what is still failed.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::snapshot::PersistedLedger;
use super::FailureLedger;

impl FailureLedger {
    /// Default path for the ledger file: `~/.local/state/jobfetch/failed_ids.json`.
    pub fn default_path() -> Result<PathBuf> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("jobfetch")?;
        Ok(xdg_dirs
            .get_state_home()
            .join("jobfetch")
            .join("failed_ids.json"))
    }

    /// Save the current snapshot to `path` (creates parent dir if needed).
    /// The file is replaced atomically, so readers never see a partial write.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir: {}", parent.display()))?;
        let json = serde_json::to_vec_pretty(&snapshot).context("serialize failure ledger")?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("create temp file in {}", parent.display()))?;
        tmp.write_all(&json)
            .with_context(|| format!("write failure ledger: {}", path.display()))?;
        tmp.persist(path)
            .with_context(|| format!("replace failure ledger: {}", path.display()))?;
        Ok(())
    }

    /// Load a ledger saved by [`save_to_path`](Self::save_to_path). A missing
    /// file is `Ok(None)`; an unreadable or malformed one is an error.
    pub fn load_from_path(path: &Path) -> Result<Option<FailureLedger>> {
        Ok(read_snapshot(path)?.map(FailureLedger::from_snapshot))
    }

    /// Identifiers still failed in the ledger at `path` (empty if the file is missing).
    pub fn pending_ids_from_path(path: &Path) -> Result<Vec<String>> {
        Ok(read_snapshot(path)?
            .map(|s| s.failed_ids())
            .unwrap_or_default())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<PersistedLedger>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("read failure ledger: {}", path.display()))
        }
    };
    let snapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse failure ledger: {}", path.display()))?;
    Ok(Some(snapshot))
}
