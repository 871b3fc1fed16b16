//! Run coordinator
//!
//! One run: lock → load ledger → catalog → select → execute → summary.
//!
//! # Phases
//! - **CATALOG** (`phase_catalog`): list metadata, skip what the listing
//!   already decides, fetch and parse the rest
//! - **EXECUTE** (`phase_execute`): run each work item end to end and
//!   commit successes to the ledger and tracking log
//!
//! Work items run sequentially. Cancellation is checked between items and
//! interrupts the current delegation call, which abandons the item.

use crate::config::WorkflowConfig;
use crate::error::{DelegationError, Result, Stage};
use crate::models::RunSummary;
use crate::services::collaborators::{
    ArchiveStore, BidsConverter, DerivativeSink, MetadataSource, RelaxometryProcessor, SeriesProbe,
};
use crate::services::converter::Dcm2BidsConverter;
use crate::services::ledger::{Ledger, LedgerDocument};
use crate::services::processor::ContainerProcessor;
use crate::services::ranking::{FieldRanking, QualityRanking};
use crate::services::scan_locator::DicomSeriesProbe;
use crate::services::selection;
use crate::services::sidecar::SidecarInjector;
use crate::services::storage;
use crate::services::tracking_log::TrackingLog;
use qmap_common::RunLock;
use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod phase_catalog;
mod phase_execute;

/// Scratch directory name inside the work root
pub const WORKING_DIR: &str = "working_dir";

/// External collaborators of a run
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataSource>,
    pub archives: Arc<dyn ArchiveStore>,
    pub sink: Arc<dyn DerivativeSink>,
    pub processor: Arc<dyn RelaxometryProcessor>,
    pub converter: Arc<dyn BidsConverter>,
    pub probe: Arc<dyn SeriesProbe>,
    pub ranking: Arc<dyn QualityRanking>,
}

impl Collaborators {
    /// Production collaborators named by the configuration
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let source = storage::build_store(&config.source);
        let sink = storage::build_store(&config.sink);
        Self {
            metadata: source.metadata,
            archives: source.archives,
            sink: sink.sink,
            processor: Arc::new(ContainerProcessor::from_config(&config.processor)),
            converter: Arc::new(Dcm2BidsConverter::from_config(&config.converter)),
            probe: Arc::new(DicomSeriesProbe::default()),
            ranking: Arc::new(FieldRanking::new(config.ranking.rules.clone())),
        }
    }
}

/// Per-run settings after CLI, environment and config resolution
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub work_root: PathBuf,
    /// Select only; no ledger writes, no delegation
    pub dry_run: bool,
    pub batch_size: usize,
    pub min_age_hours: u64,
    pub keep_work_dirs: bool,
}

impl RunOptions {
    pub fn from_config(config: &WorkflowConfig, work_root: PathBuf) -> Self {
        Self {
            work_root,
            dry_run: false,
            batch_size: config.batch_size,
            min_age_hours: config.min_age_hours,
            keep_work_dirs: config.keep_work_dirs,
        }
    }
}

/// Drives one run over the configured collaborators
pub struct RunCoordinator {
    config: WorkflowConfig,
    options: RunOptions,
    collaborators: Collaborators,
    sidecars: SidecarInjector,
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(
        config: WorkflowConfig,
        options: RunOptions,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let sidecars = SidecarInjector::new(config.sidecar.clone());
        Self {
            config,
            options,
            collaborators,
            sidecars,
            cancel,
        }
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn ledger_path(&self) -> PathBuf {
        Ledger::path_in(&self.options.work_root)
    }

    fn scratch_dir(&self, label: &str) -> PathBuf {
        self.options.work_root.join(WORKING_DIR).join(label)
    }

    /// Execute one run and report what happened.
    ///
    /// Run-fatal conditions (lock contention, ledger corruption, listing
    /// failure) are errors; per-item failures are in the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = qmap_common::time::now();
        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::new(run_id, self.options.dry_run, started_at);

        tracing::info!(
            run_id = %run_id,
            work_root = %self.options.work_root.display(),
            batch_size = self.options.batch_size,
            dry_run = self.options.dry_run,
            "Run starting"
        );

        if self.options.dry_run {
            let doc = Ledger::read(&self.ledger_path())?.unwrap_or_default();
            self.select(&doc, &mut summary).await?;
            summary.finished_at = Some(qmap_common::time::now());
            return Ok(summary);
        }

        let ledger_path = self.ledger_path();
        let _lock = RunLock::acquire(&Ledger::lock_path_for(&ledger_path))?;
        let log = TrackingLog::in_work_root(&self.options.work_root);

        let mut ledger = Ledger::load_or_create(&ledger_path)?;
        let recovered = ledger.reconcile_pending(&log)?;
        if recovered > 0 {
            tracing::info!(recovered, "Reconciled pending tracking log entries");
        }

        let work_items = self.select_and_register(&mut ledger, &mut summary).await?;
        self.phase_execute(work_items, &mut ledger, &log, &mut summary)
            .await?;

        summary.finished_at = Some(qmap_common::time::now());
        tracing::info!(run_id = %run_id, "Run finished: {}", summary.display_string());
        Ok(summary)
    }

    /// Dry-run selection: fill the summary with what a run would do
    async fn select(&self, doc: &LedgerDocument, summary: &mut RunSummary) -> Result<()> {
        let catalog = self.phase_catalog(doc, summary).await?;
        let mut plan = selection::plan(&catalog, doc, self.collaborators.ranking.as_ref());
        summary.deferred = selection::apply_batch_limit(&mut plan, self.options.batch_size);
        record_plan(summary, &plan);
        summary.planned = plan
            .work_items
            .iter()
            .map(|w| (w.key.clone(), w.archive().clone(), w.forced))
            .collect();
        Ok(())
    }

    async fn select_and_register(
        &self,
        ledger: &mut Ledger,
        summary: &mut RunSummary,
    ) -> Result<Vec<crate::models::WorkItem>> {
        let doc = ledger.document().clone();
        let catalog = self.phase_catalog(&doc, summary).await?;

        let seen: Vec<_> = catalog
            .keys()
            .chain(summary.failed.iter().map(|f| &f.session))
            .cloned()
            .collect();
        ledger.register_seen(seen.iter(), summary.started_at)?;

        let mut plan = selection::plan(&catalog, ledger.document(), self.collaborators.ranking.as_ref());
        summary.deferred = selection::apply_batch_limit(&mut plan, self.options.batch_size);
        record_plan(summary, &plan);

        tracing::info!(
            selected = plan.work_items.len(),
            skipped = plan.skipped.len(),
            deferred = summary.deferred.len(),
            "Selection complete"
        );
        Ok(plan.work_items)
    }
}

fn record_plan(summary: &mut RunSummary, plan: &crate::models::SelectionPlan) {
    summary.skipped = plan.skipped.clone();
    summary.without_candidates = plan.without_candidates.len();
    summary.new_data_under_consideration = plan.new_data_under_consideration.clone();
}

/// Bound a delegation call by a timeout and the run's cancellation token
pub(crate) async fn guarded<T, E, F>(
    cancel: &CancellationToken,
    stage: Stage,
    secs: u64,
    fut: F,
) -> std::result::Result<T, DelegationError>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DelegationError::Cancelled { stage }),
        res = tokio::time::timeout(qmap_common::time::secs_to_duration(secs), fut) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DelegationError::failed(stage, e)),
            Err(_) => Err(DelegationError::TimedOut { stage, secs }),
        },
    }
}

/// Paths of every file under `dir`, relative to `base`, sorted
pub(crate) fn relative_files(base: &Path, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(base) {
                files.push(rel.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}
