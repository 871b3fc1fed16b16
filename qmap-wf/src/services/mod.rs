//! Workflow services
//!
//! Pure decision logic (catalog, ranking, selection), persisted state
//! (ledger, tracking log), external collaborators and the run coordinator
//! that drives them.

pub mod collaborators;
pub mod command;
pub mod converter;
pub mod ledger;
pub mod processor;
pub mod qc_catalog;
pub mod ranking;
pub mod run_coordinator;
pub mod scan_locator;
pub mod selection;
pub mod sidecar;
pub mod storage;
pub mod tracking_log;

pub use collaborators::{
    ArchiveStore, BidsConverter, BidsOutput, DerivativeSink, MetadataSource, ObjectInfo,
    RelaxometryProcessor, SeriesInfo, SeriesProbe,
};
pub use converter::Dcm2BidsConverter;
pub use ledger::{CommitRecord, Ledger, LedgerDocument, LedgerEntry, LedgerStatus};
pub use processor::ContainerProcessor;
pub use ranking::{FieldRanking, FieldRule, Preference, QualityRanking};
pub use run_coordinator::{Collaborators, RunCoordinator, RunOptions};
pub use scan_locator::{DicomSeriesProbe, LocateError};
pub use sidecar::{SidecarError, SidecarInjector};
pub use storage::{LocalStore, S3cmdStore, StoreHandles};
pub use tracking_log::TrackingLog;
