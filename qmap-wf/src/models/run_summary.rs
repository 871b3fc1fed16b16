//! End-of-run summary
//!
//! Enumerates processed, skipped and failed sessions with reasons, plus
//! the counters the operator needs to judge the health of the source data.

use super::qc_record::{ArchiveId, SessionKey};
use super::work_item::SkipReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A session processed in this run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedReport {
    pub session: SessionKey,
    pub archive: ArchiveId,
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded: Option<ArchiveId>,
    pub attempt_id: Uuid,
}

/// A session whose work item was abandoned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub session: SessionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveId>,
    pub stage: String,
    pub reason: String,
}

/// A quality-metadata record that could not be used
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalformedReport {
    pub metadata_key: String,
    pub reason: String,
}

/// Result of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: Vec<ProcessedReport>,
    /// Selected items not executed in a dry run
    pub planned: Vec<(SessionKey, ArchiveId, bool)>,
    pub skipped: Vec<(SessionKey, SkipReason)>,
    pub failed: Vec<FailureReport>,
    /// Selected but left for a later run (batch limit or cancellation)
    pub deferred: Vec<SessionKey>,
    pub without_candidates: usize,
    pub malformed: Vec<MalformedReport>,
    /// Metadata objects younger than the minimum age
    pub too_recent: usize,
    pub new_data_under_consideration: Vec<(SessionKey, Vec<ArchiveId>)>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(run_id: Uuid, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            dry_run,
            started_at,
            finished_at: None,
            processed: Vec::new(),
            planned: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            deferred: Vec::new(),
            without_candidates: 0,
            malformed: Vec::new(),
            too_recent: 0,
            new_data_under_consideration: Vec::new(),
            cancelled: false,
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// One-line counters, e.g. for the final log record
    pub fn display_string(&self) -> String {
        format!(
            "{} processed, {} planned, {} skipped, {} failed, {} deferred, {} malformed records",
            self.processed.len(),
            self.planned.len(),
            self.skipped.len(),
            self.failed.len(),
            self.deferred.len(),
            self.malformed.len()
        )
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}{}", self.run_id, if self.dry_run { " (dry run)" } else { "" })?;
        writeln!(f, "  {}", self.display_string())?;
        if self.cancelled {
            writeln!(f, "  run was cancelled before all work items started")?;
        }

        if !self.processed.is_empty() {
            writeln!(f, "Processed:")?;
            for p in &self.processed {
                write!(f, "  {}  {}", p.session, p.archive)?;
                if p.forced {
                    write!(f, "  [forced]")?;
                }
                if let Some(prev) = &p.superseded {
                    write!(f, "  (supersedes {})", prev)?;
                }
                writeln!(f)?;
            }
        }

        if !self.planned.is_empty() {
            writeln!(f, "Planned:")?;
            for (session, archive, forced) in &self.planned {
                writeln!(
                    f,
                    "  {}  {}{}",
                    session,
                    archive,
                    if *forced { "  [forced]" } else { "" }
                )?;
            }
        }

        if !self.failed.is_empty() {
            writeln!(f, "Failed:")?;
            for failure in &self.failed {
                let archive = failure
                    .archive
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                writeln!(
                    f,
                    "  {}  {}  [{}] {}",
                    failure.session, archive, failure.stage, failure.reason
                )?;
            }
        }

        if !self.skipped.is_empty() {
            writeln!(f, "Skipped:")?;
            for (session, reason) in &self.skipped {
                writeln!(f, "  {}  {}", session, reason)?;
            }
        }

        if !self.deferred.is_empty() {
            writeln!(f, "Deferred to a later run:")?;
            for session in &self.deferred {
                writeln!(f, "  {}", session)?;
            }
        }

        if !self.new_data_under_consideration.is_empty() {
            writeln!(f, "New archives for sessions under consideration:")?;
            for (session, archives) in &self.new_data_under_consideration {
                let names: Vec<&str> = archives.iter().map(|a| a.as_str()).collect();
                writeln!(f, "  {}  {}", session, names.join(", "))?;
            }
        }

        if !self.malformed.is_empty() {
            writeln!(f, "Malformed metadata records:")?;
            for m in &self.malformed {
                writeln!(f, "  {}  {}", m.metadata_key, m.reason)?;
            }
        }

        if self.without_candidates > 0 || self.too_recent > 0 {
            writeln!(
                f,
                "  {} sessions without a usable QALAS candidate, {} metadata objects too recent",
                self.without_candidates, self.too_recent
            )?;
        }
        Ok(())
    }
}
