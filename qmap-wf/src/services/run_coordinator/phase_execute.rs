//! Phase 2: EXECUTE
//!
//! Runs each work item through download, unpack, locate, processor,
//! converter, sidecar injection and upload. Only a fully delivered item is
//! committed; any failure abandons it and leaves ledger and tracking log
//! untouched so the next run retries it.

use super::{guarded, relative_files, RunCoordinator};
use crate::error::{DelegationError, Result, Stage};
use crate::models::{
    FailureReport, Outcome, ProcessedReport, RunSummary, TrackingEntry, WorkItem, WorkItemProgress,
    WorkItemState,
};
use crate::services::command::render_template;
use crate::services::ledger::{CommitRecord, Ledger};
use crate::services::scan_locator;
use crate::services::tracking_log::TrackingLog;
use qmap_common::fsutil;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// What a delivered work item produced
#[derive(Debug, Clone, Copy)]
struct Delivery {
    niftis_generated: usize,
    files_uploaded: usize,
}

impl RunCoordinator {
    /// Phase 2: EXECUTE - run work items in order
    pub(super) async fn phase_execute(
        &self,
        work_items: Vec<WorkItem>,
        ledger: &mut Ledger,
        log: &TrackingLog,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let total = work_items.len();
        tracing::info!(work_items = total, "Phase 2: EXECUTE");

        let mut items = work_items.into_iter().enumerate();
        while let Some((index, item)) = items.next() {
            if self.cancel.is_cancelled() {
                tracing::warn!(remaining = total - index, "Cancelled, deferring remaining work items");
                summary.cancelled = true;
                summary.deferred.push(item.key);
                summary.deferred.extend(items.by_ref().map(|(_, rest)| rest.key));
                break;
            }

            tracing::info!(
                session = %item.key,
                archive = %item.archive(),
                forced = item.forced,
                item = index + 1,
                of = total,
                "Work item starting"
            );

            let started_at = qmap_common::time::now();
            let scratch = self.scratch_dir(&item.key.label());
            let mut progress = WorkItemProgress::new(item.key.clone());

            let result = match fsutil::remove_dir_all_if_exists(&scratch) {
                Ok(()) => self.execute_item(&item, &scratch, &mut progress).await,
                Err(e) => Err(DelegationError::failed(Stage::Download, e)),
            };

            match result {
                Ok(delivery) => {
                    let entry = TrackingEntry {
                        attempt_id: Uuid::new_v4(),
                        session: item.key.clone(),
                        archive: item.archive().clone(),
                        series_instance_uid: item.selected.series_instance_uid.clone(),
                        outcome: if item.forced {
                            Outcome::Reprocessed
                        } else {
                            Outcome::Processed
                        },
                        niftis_generated: delivery.niftis_generated,
                        files_uploaded: delivery.files_uploaded,
                        started_at,
                        committed_at: qmap_common::time::now(),
                    };
                    let attempt_id = entry.attempt_id;
                    ledger.commit(
                        &CommitRecord {
                            entry,
                            forced: item.forced,
                            listed_archives: item.listed_archives.clone(),
                            ranking_fingerprint: self.collaborators.ranking.fingerprint(),
                        },
                        log,
                    )?;
                    progress.transition_to(WorkItemState::Committed);

                    summary.processed.push(ProcessedReport {
                        session: item.key.clone(),
                        archive: item.archive().clone(),
                        forced: item.forced,
                        superseded: item
                            .previous_archive
                            .clone()
                            .filter(|prev| prev != item.archive()),
                        attempt_id,
                    });
                }
                Err(e) => {
                    progress.transition_to(WorkItemState::Abandoned);
                    tracing::warn!(
                        session = %item.key,
                        archive = %item.archive(),
                        stage = %e.stage(),
                        error = %e,
                        "Work item abandoned"
                    );
                    if matches!(e, DelegationError::Cancelled { .. }) {
                        summary.cancelled = true;
                    }
                    summary.failed.push(FailureReport {
                        session: item.key.clone(),
                        archive: Some(item.archive().clone()),
                        stage: e.stage().to_string(),
                        reason: e.reason(),
                    });
                }
            }

            if !self.options.keep_work_dirs {
                if let Err(e) = fsutil::remove_dir_all_if_exists(&scratch) {
                    tracing::warn!(dir = %scratch.display(), error = %e, "Failed to remove working directory");
                }
            }
        }
        Ok(())
    }

    /// Deliver one work item end to end
    async fn execute_item(
        &self,
        item: &WorkItem,
        scratch: &Path,
        progress: &mut WorkItemProgress,
    ) -> std::result::Result<Delivery, DelegationError> {
        let timeouts = &self.config.timeouts;
        let key = &item.key;

        // Download and unpack
        progress.transition_to(WorkItemState::Downloading);
        let download_dir = scratch.join("download");
        let archive_path = guarded(
            &self.cancel,
            Stage::Download,
            timeouts.download_secs,
            self.collaborators
                .archives
                .fetch_archive(item.archive(), &download_dir),
        )
        .await?;

        let unpacked = scratch.join("unpacked");
        guarded(
            &self.cancel,
            Stage::Unpack,
            timeouts.unpack_secs,
            self.collaborators.archives.unpack(&archive_path, &unpacked),
        )
        .await?;

        let probe = self.collaborators.probe.clone();
        let record = item.selected.clone();
        let root = unpacked.clone();
        let locate = tokio::task::spawn_blocking(move || {
            scan_locator::locate_scan_folder(&root, probe.as_ref(), &record)
        });
        let (scan_dir, series) = guarded(&self.cancel, Stage::Locate, timeouts.unpack_secs, locate)
            .await?
            .map_err(|e| DelegationError::failed(Stage::Locate, e))?;
        tracing::debug!(session = %key, scan_dir = %scan_dir.display(), "Scan folder located");

        // Delegate to the external tools
        progress.transition_to(WorkItemState::Delegated);
        let maps_dir = scratch.join("maps");
        let processor_log = scratch.join("symri_container.log");
        let maps = guarded(
            &self.cancel,
            Stage::Processor,
            timeouts.processor_secs,
            self.collaborators
                .processor
                .generate_maps(&scan_dir, &maps_dir, &processor_log),
        )
        .await?;
        tracing::info!(session = %key, maps = maps.len(), "Relaxometry maps generated");

        let bids_dir = scratch.join("bids");
        let output = guarded(
            &self.cancel,
            Stage::Converter,
            timeouts.converter_secs,
            self.collaborators.converter.convert(
                &maps_dir,
                key,
                &bids_dir,
                &scratch.join("dcm2bids.log"),
            ),
        )
        .await?;

        self.sidecars
            .apply(&output, key, &series, &item.selected, &processor_log)
            .map_err(|e| DelegationError::failed(Stage::Sidecar, e))?;

        // Upload the session's anat files
        let mut vars = BTreeMap::new();
        vars.insert("subject".to_string(), key.subject.clone());
        vars.insert("session".to_string(), key.session.clone());
        let prefix = render_template(&self.config.upload.prefix_template, &vars)
            .map_err(|e| DelegationError::failed(Stage::Upload, e))?;
        let files = relative_files(&bids_dir, &output.anat_dir)
            .map_err(|e| DelegationError::failed(Stage::Upload, e))?;

        let files_uploaded = guarded(
            &self.cancel,
            Stage::Upload,
            timeouts.upload_secs,
            self.collaborators.sink.upload(&bids_dir, &files, &prefix),
        )
        .await?;
        tracing::info!(session = %key, prefix = %prefix, files = files_uploaded, "Derivatives uploaded");

        Ok(Delivery {
            niftis_generated: output.niftis.len(),
            files_uploaded,
        })
    }
}
