//! Destructive memory wipe: the operator kill switch for everything the
//! broker has persisted.
//!
//! Removing the whole storage root takes tier 2, tier 3 and the audit log with
//! it in one pass; when that fails (e.g. a foreign file holding the directory
//! open) each store is removed individually so a partial wipe still destroys
//! as much as possible.

use crate::config::CoreConfig;
use crate::error::WardenResult;
use serde::Serialize;
use std::path::Path;

/// What the wipe actually removed.
#[derive(Debug, Default, Serialize)]
pub struct WipeReport {
    pub facts: bool,
    pub semantic: bool,
    pub audit: bool,
    pub storage_dir: bool,
}

impl WipeReport {
    pub fn anything_removed(&self) -> bool {
        self.facts || self.semantic || self.audit || self.storage_dir
    }
}

/// Delete all persisted state under the storage root. The in-process tier-1
/// cache is not touched here; callers clear it (or restart) themselves.
///
/// Never called without explicit operator confirmation upstream.
pub fn wipe_all(config: &CoreConfig) -> WardenResult<WipeReport> {
    let mut report = WipeReport::default();

    if config.storage_dir.exists() {
        match std::fs::remove_dir_all(&config.storage_dir) {
            Ok(()) => {
                tracing::info!(dir = %config.storage_dir.display(), "wipe: removed storage root");
                report.storage_dir = true;
                report.facts = true;
                report.semantic = true;
                report.audit = true;
                return Ok(report);
            }
            Err(e) => {
                tracing::warn!(error = %e, "wipe: could not remove storage root, falling back to per-store removal");
            }
        }
    }

    report.facts = remove_path(&config.facts_db_path());
    // SQLite sidecar files survive an interrupted process.
    for suffix in ["-wal", "-shm"] {
        let mut name = config.facts_db_path().into_os_string();
        name.push(suffix);
        remove_path(Path::new(&name));
    }
    report.semantic = remove_path(&config.semantic_db_path());
    report.audit = remove_path(&config.audit_dir());
    Ok(report)
}

fn remove_path(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            tracing::info!(path = %path.display(), "wipe: removed");
            true
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "wipe: could not remove");
            false
        }
    }
}
