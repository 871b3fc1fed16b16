//! Data models for the relaxometry workflow

pub mod qc_record;
pub mod run_summary;
pub mod tracking;
pub mod work_item;

pub use qc_record::{ArchiveId, QcRecord, QualityScore, SessionKey};
pub use run_summary::{FailureReport, MalformedReport, ProcessedReport, RunSummary};
pub use tracking::{Outcome, TrackingEntry};
pub use work_item::{
    Disposition, SelectionPlan, SkipReason, WorkItem, WorkItemProgress, WorkItemState,
};
