//! Tracking log: newline-delimited JSON, one line per committed attempt
//!
//! Audit only. Nothing in the selection path reads it; the ledger is the
//! source of truth for what has been processed.

use crate::models::TrackingEntry;
use qmap_common::{fsutil, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Log location relative to the work root
pub const TRACKING_LOG_RELATIVE: &str = "logs/tracking_log.ndjson";

#[derive(Debug, Clone)]
pub struct TrackingLog {
    path: PathBuf,
}

impl TrackingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log under `work_root`
    pub fn in_work_root(work_root: &Path) -> Self {
        Self::new(work_root.join(TRACKING_LOG_RELATIVE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and sync
    pub fn append(&self, entry: &TrackingEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        fsutil::append_line_durable(&self.path, &line)?;
        tracing::debug!(
            session = %entry.session,
            attempt_id = %entry.attempt_id,
            "Tracking log entry appended"
        );
        Ok(())
    }

    /// Every readable entry in file order; unreadable lines are skipped
    pub fn entries(&self) -> Result<Vec<TrackingEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TrackingEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    log = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "Skipping unreadable tracking log line"
                ),
            }
        }
        Ok(entries)
    }

    pub fn contains(&self, attempt_id: Uuid) -> Result<bool> {
        Ok(self.entries()?.iter().any(|e| e.attempt_id == attempt_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchiveId, Outcome, SessionKey};
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry() -> TrackingEntry {
        TrackingEntry {
            attempt_id: Uuid::new_v4(),
            session: SessionKey::new("S", "V01"),
            archive: ArchiveId::new("A_S_V01.tar.gz"),
            series_instance_uid: Some("1.2.3".to_string()),
            outcome: Outcome::Processed,
            niftis_generated: 4,
            files_uploaded: 9,
            started_at: Utc::now(),
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let log = TrackingLog::in_work_root(dir.path());
        assert!(log.entries().unwrap().is_empty());

        let first = entry();
        let second = entry();
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries, vec![first.clone(), second]);
        assert!(log.contains(first.attempt_id).unwrap());
        assert!(!log.contains(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn test_garbage_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let log = TrackingLog::in_work_root(dir.path());
        let good = entry();
        log.append(&good).unwrap();
        fsutil::append_line_durable(log.path(), "not json").unwrap();

        assert_eq!(log.entries().unwrap(), vec![good]);
    }
}
