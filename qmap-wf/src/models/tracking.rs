//! Tracking log entries (audit trail of committed attempts)

use super::qc_record::{ArchiveId, SessionKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a committed attempt came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// First processing, or processing of a newly best archive
    Processed,
    /// Forced by a `to_reprocess` flag
    Reprocessed,
}

/// One committed processing attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEntry {
    pub attempt_id: Uuid,
    pub session: SessionKey,
    pub archive: ArchiveId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_instance_uid: Option<String>,
    pub outcome: Outcome,
    pub niftis_generated: usize,
    pub files_uploaded: usize,
    pub started_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
}
