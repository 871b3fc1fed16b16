//! Work items and their per-run state machine
//!
//! `Selected → Downloading → Delegated → {Committed | Abandoned}`

use super::qc_record::{ArchiveId, QcRecord, SessionKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a session produces no work item this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Listed in `consider_reprocessing`; new archives are ignored
    UnderConsideration,
    /// Best candidate is the archive of the last successful attempt
    AlreadyProcessed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnderConsideration => f.write_str("under consideration for reprocessing"),
            SkipReason::AlreadyProcessed => f.write_str("already processed with best archive"),
        }
    }
}

/// Decision for one session in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Process the best candidate
    Process,
    /// Reprocess on explicit request, overwriting earlier derivatives
    ForceReprocess,
    /// Nothing to do
    Skip(SkipReason),
}

/// One unit of end-to-end processing
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub key: SessionKey,
    pub selected: QcRecord,
    /// True when driven by a `to_reprocess` flag
    pub forced: bool,
    /// Archive of the last successful attempt, if any
    pub previous_archive: Option<ArchiveId>,
    /// Every archive listed for the session when it was selected
    pub listed_archives: Vec<ArchiveId>,
}

impl WorkItem {
    pub fn archive(&self) -> &ArchiveId {
        &self.selected.archive
    }
}

/// Execution state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Selected,
    Downloading,
    Delegated,
    Committed,
    Abandoned,
}

impl WorkItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemState::Committed | WorkItemState::Abandoned)
    }

    /// Legal forward transitions. Any non-terminal state may be abandoned.
    pub fn can_transition_to(self, next: WorkItemState) -> bool {
        use WorkItemState::*;
        match (self, next) {
            (Selected, Downloading) => true,
            (Downloading, Delegated) => true,
            (Delegated, Committed) => true,
            (from, Abandoned) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Tracks the state of one work item through a run
#[derive(Debug)]
pub struct WorkItemProgress {
    key: SessionKey,
    state: WorkItemState,
}

impl WorkItemProgress {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            state: WorkItemState::Selected,
        }
    }

    pub fn state(&self) -> WorkItemState {
        self.state
    }

    /// Move to `next`; illegal transitions are logged and ignored
    pub fn transition_to(&mut self, next: WorkItemState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                session = %self.key,
                from = ?self.state,
                to = ?next,
                "Ignoring illegal work item transition"
            );
            return false;
        }
        tracing::debug!(session = %self.key, from = ?self.state, to = ?next, "Work item transition");
        self.state = next;
        true
    }
}

/// Output of the selection engine for one run
#[derive(Debug, Clone, Default)]
pub struct SelectionPlan {
    /// Ordered: forced items first, then fresh items, each by session key
    pub work_items: Vec<WorkItem>,
    pub skipped: Vec<(SessionKey, SkipReason)>,
    /// Sessions listed but without any usable candidate
    pub without_candidates: Vec<SessionKey>,
    /// Archives that appeared since the last commit of sessions under consideration
    pub new_data_under_consideration: Vec<(SessionKey, Vec<ArchiveId>)>,
}
