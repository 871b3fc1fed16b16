//! Reprocessing Ledger
//!
//! TOML document next to the tracking log:
//!
//! ```toml
//! version = 1
//! consider_reprocessing = ["sub-880852_ses-V02"]   # edited by operators
//! to_reprocess = ["sub-123456_ses-V01"]            # edited by operators
//!
//! [sessions."sub-880852_ses-V02"]                  # maintained by qmap-wf
//! first_seen = "2024-03-07T09:05:01Z"
//! last_archive = "site/UMN_880852_V02.tar.gz"
//! last_processed_at = "2024-03-08T02:11:40Z"
//! known_archives = ["site/UMN_880852_V02.tar.gz"]
//! attempts = 1
//! ```
//!
//! Every write re-reads the file, applies one targeted mutation and replaces
//! the file atomically, so operator edits made during a run survive.
//! Callers hold the run lock for the whole read-decide-write cycle.

use crate::error::{Result, WorkflowError};
use crate::models::{ArchiveId, SessionKey, TrackingEntry};
use crate::services::tracking_log::TrackingLog;
use chrono::{DateTime, Utc};
use qmap_common::fsutil;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Ledger file name inside the work root
pub const LEDGER_FILE: &str = "ledger.toml";

/// Current document version
pub const LEDGER_VERSION: u32 = 1;

/// Processing intent of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Untouched,
    ConsiderReprocessing,
    ToReprocess,
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerStatus::Untouched => f.write_str("untouched"),
            LedgerStatus::ConsiderReprocessing => f.write_str("consider_reprocessing"),
            LedgerStatus::ToReprocess => f.write_str("to_reprocess"),
        }
    }
}

/// History of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default = "qmap_common::time::now")]
    pub first_seen: DateTime<Utc>,

    /// Archive of the last committed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_archive: Option<ArchiveId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_series_instance_uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,

    /// Archives listed for the session at the last commit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_archives: Vec<ArchiveId>,

    /// Ranking fingerprint in force at the last commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranking_fingerprint: Option<String>,

    /// Committed attempts
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_id: Option<Uuid>,
}

impl LedgerEntry {
    pub fn new(first_seen: DateTime<Utc>) -> Self {
        Self {
            first_seen,
            last_archive: None,
            last_series_instance_uid: None,
            last_processed_at: None,
            known_archives: Vec::new(),
            ranking_fingerprint: None,
            attempts: 0,
            last_attempt_id: None,
        }
    }
}

/// Persisted ledger document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Sessions an operator is reviewing; new archives are ignored
    #[serde(default)]
    pub consider_reprocessing: Vec<SessionKey>,

    /// Sessions to reprocess on the next run
    #[serde(default)]
    pub to_reprocess: Vec<SessionKey>,

    #[serde(default)]
    pub sessions: BTreeMap<SessionKey, LedgerEntry>,

    /// Committed attempts whose tracking log line may not be written yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_log: Vec<TrackingEntry>,
}

fn default_version() -> u32 {
    LEDGER_VERSION
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            consider_reprocessing: Vec::new(),
            to_reprocess: Vec::new(),
            sessions: BTreeMap::new(),
            pending_log: Vec::new(),
        }
    }
}

impl LedgerDocument {
    /// `to_reprocess` wins over `consider_reprocessing`
    pub fn status(&self, key: &SessionKey) -> LedgerStatus {
        if self.to_reprocess.contains(key) {
            LedgerStatus::ToReprocess
        } else if self.consider_reprocessing.contains(key) {
            LedgerStatus::ConsiderReprocessing
        } else {
            LedgerStatus::Untouched
        }
    }

    /// Human-readable status overview
    pub fn report(&self) -> String {
        let processed = self
            .sessions
            .values()
            .filter(|e| e.last_archive.is_some())
            .count();
        let mut out = format!(
            "{} sessions known, {} processed, {} to reprocess, {} under consideration\n",
            self.sessions.len(),
            processed,
            self.to_reprocess.len(),
            self.consider_reprocessing.len()
        );
        if !self.pending_log.is_empty() {
            out.push_str(&format!(
                "{} committed attempts awaiting tracking log reconciliation\n",
                self.pending_log.len()
            ));
        }
        for key in &self.to_reprocess {
            out.push_str(&format!("  to_reprocess           {}\n", key));
        }
        for key in &self.consider_reprocessing {
            out.push_str(&format!("  consider_reprocessing  {}\n", key));
        }
        for (key, entry) in &self.sessions {
            let archive = entry
                .last_archive
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            let when = entry
                .last_processed_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            out.push_str(&format!(
                "  {:<24} {:<22} {}  {}\n",
                key.label(),
                self.status(key).to_string(),
                when,
                archive
            ));
        }
        out
    }
}

/// What a successful work item writes into the ledger
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub entry: TrackingEntry,
    /// Driven by a `to_reprocess` flag, which is consumed
    pub forced: bool,
    /// Archives listed for the session when it was selected
    pub listed_archives: Vec<ArchiveId>,
    /// [`QualityRanking::fingerprint`](crate::services::ranking::QualityRanking::fingerprint)
    /// of the ranking that chose the archive
    pub ranking_fingerprint: String,
}

/// Loaded ledger bound to its file
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    doc: LedgerDocument,
    /// SHA-256 of the file content last read or written
    digest: String,
}

impl Ledger {
    /// Ledger path inside `work_root`
    pub fn path_in(work_root: &Path) -> PathBuf {
        work_root.join(LEDGER_FILE)
    }

    /// Lock file guarding `ledger_path`
    pub fn lock_path_for(ledger_path: &Path) -> PathBuf {
        let mut name = ledger_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| LEDGER_FILE.into());
        name.push(".lock");
        ledger_path.with_file_name(name)
    }

    /// Parse ledger text; any error is corruption
    pub fn parse(path: &Path, content: &str) -> Result<LedgerDocument> {
        let doc: LedgerDocument =
            toml::from_str(content).map_err(|e| WorkflowError::LedgerCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if doc.version > LEDGER_VERSION {
            return Err(WorkflowError::LedgerCorrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", doc.version),
            });
        }
        Ok(doc)
    }

    /// Read the ledger without creating it (`None` when absent)
    pub fn read(path: &Path) -> Result<Option<LedgerDocument>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the ledger, creating and persisting an empty one when absent.
    ///
    /// An unparseable file is fatal and left untouched.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let doc = Self::parse(path, &content)?;
                tracing::info!(
                    ledger = %path.display(),
                    sessions = doc.sessions.len(),
                    to_reprocess = doc.to_reprocess.len(),
                    consider_reprocessing = doc.consider_reprocessing.len(),
                    "Ledger loaded"
                );
                Ok(Self {
                    path: path.to_path_buf(),
                    doc,
                    digest: fsutil::sha256_hex(content.as_bytes()),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let doc = LedgerDocument::default();
                let content = toml::to_string_pretty(&doc)
                    .map_err(|e| WorkflowError::Common(e.into()))?;
                fsutil::write_atomic(path, content.as_bytes())?;
                tracing::info!(ledger = %path.display(), "Created empty ledger");
                Ok(Self {
                    path: path.to_path_buf(),
                    doc,
                    digest: fsutil::sha256_hex(content.as_bytes()),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &LedgerDocument {
        &self.doc
    }

    pub fn status(&self, key: &SessionKey) -> LedgerStatus {
        self.doc.status(key)
    }

    pub fn entry(&self, key: &SessionKey) -> Option<&LedgerEntry> {
        self.doc.sessions.get(key)
    }

    /// Create entries for sessions seen for the first time.
    ///
    /// Writes only when something was added. Returns the number added.
    pub fn register_seen<'a, I>(&mut self, keys: I, now: DateTime<Utc>) -> Result<usize>
    where
        I: IntoIterator<Item = &'a SessionKey>,
    {
        let new_keys: BTreeSet<SessionKey> = keys
            .into_iter()
            .filter(|k| !self.doc.sessions.contains_key(k))
            .cloned()
            .collect();
        if new_keys.is_empty() {
            return Ok(0);
        }

        let count = new_keys.len();
        self.persist(|doc| {
            for key in new_keys {
                doc.sessions
                    .entry(key)
                    .or_insert_with(|| LedgerEntry::new(now));
            }
        })?;
        tracing::info!(count, "Registered new sessions in ledger");
        Ok(count)
    }

    /// Commit a successful attempt.
    ///
    /// 1. Write the session history plus a pending tracking entry (commit point).
    /// 2. Append the tracking entry to the log.
    /// 3. Clear the pending entry.
    ///
    /// Failures after step 1 leave the pending entry for
    /// [`Ledger::reconcile_pending`] on the next run.
    pub fn commit(&mut self, record: &CommitRecord, log: &TrackingLog) -> Result<()> {
        let entry = record.entry.clone();
        let key = entry.session.clone();
        let attempt_id = entry.attempt_id;

        self.persist(|doc| {
            let history = doc
                .sessions
                .entry(key.clone())
                .or_insert_with(|| LedgerEntry::new(entry.started_at));
            history.last_archive = Some(entry.archive.clone());
            history.last_series_instance_uid = entry.series_instance_uid.clone();
            history.last_processed_at = Some(entry.committed_at);
            history.known_archives = record.listed_archives.clone();
            history.ranking_fingerprint = Some(record.ranking_fingerprint.clone());
            history.attempts = history.attempts.saturating_add(1);
            history.last_attempt_id = Some(attempt_id);

            if record.forced {
                doc.to_reprocess.retain(|k| k != &key);
            }
            doc.pending_log.retain(|p| p.attempt_id != attempt_id);
            doc.pending_log.push(entry.clone());
        })?;

        tracing::info!(
            session = %key,
            archive = %record.entry.archive,
            attempt_id = %attempt_id,
            forced = record.forced,
            "Ledger commit"
        );

        if let Err(e) = log.append(&record.entry) {
            tracing::warn!(
                session = %key,
                attempt_id = %attempt_id,
                error = %e,
                "Tracking log append failed; entry stays pending in ledger"
            );
            return Ok(());
        }

        if let Err(e) = self.persist(|doc| doc.pending_log.retain(|p| p.attempt_id != attempt_id)) {
            tracing::warn!(
                session = %key,
                attempt_id = %attempt_id,
                error = %e,
                "Clearing pending tracking entry failed; will reconcile next run"
            );
        }
        Ok(())
    }

    /// Finish commits interrupted between ledger write and log append.
    ///
    /// Returns the number of pending entries cleared.
    pub fn reconcile_pending(&mut self, log: &TrackingLog) -> Result<usize> {
        if self.doc.pending_log.is_empty() {
            return Ok(0);
        }

        let pending = self.doc.pending_log.clone();
        for entry in &pending {
            if log.contains(entry.attempt_id)? {
                continue;
            }
            log.append(entry)?;
            tracing::info!(
                session = %entry.session,
                attempt_id = %entry.attempt_id,
                "Recovered pending tracking log entry"
            );
        }

        let ids: BTreeSet<Uuid> = pending.iter().map(|e| e.attempt_id).collect();
        self.persist(|doc| doc.pending_log.retain(|p| !ids.contains(&p.attempt_id)))?;
        Ok(ids.len())
    }

    /// Re-read the file, apply `mutate` and replace the file atomically
    fn persist<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut LedgerDocument),
    {
        let mut doc = match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                if fsutil::sha256_hex(content.as_bytes()) != self.digest {
                    tracing::info!(
                        ledger = %self.path.display(),
                        "Ledger changed on disk since last read, merging"
                    );
                }
                Self::parse(&self.path, &content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    ledger = %self.path.display(),
                    "Ledger file disappeared during run, rewriting from memory"
                );
                self.doc.clone()
            }
            Err(e) => return Err(e.into()),
        };

        mutate(&mut doc);

        let content = toml::to_string_pretty(&doc).map_err(|e| WorkflowError::Common(e.into()))?;
        fsutil::write_atomic(&self.path, content.as_bytes())?;
        self.digest = fsutil::sha256_hex(content.as_bytes());
        self.doc = doc;
        Ok(())
    }
}
