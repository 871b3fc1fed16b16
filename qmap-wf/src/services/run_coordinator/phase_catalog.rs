//! Phase 1: CATALOG
//!
//! Lists quality metadata, groups it by session and builds candidate sets.
//! Sessions the listing already decides (under consideration, or already
//! processed with an unchanged archive set) are not fetched.

use super::{guarded, RunCoordinator};
use crate::error::{Result, Stage, StorageError, WorkflowError};
use crate::models::{FailureReport, MalformedReport, RunSummary, SessionKey};
use crate::services::ledger::LedgerDocument;
use crate::services::qc_catalog;
use crate::services::selection::{self, SessionCandidates};
use std::collections::BTreeMap;

impl RunCoordinator {
    /// Phase 1: CATALOG - candidate sets for every listed session
    ///
    /// Malformed records are counted in the summary. A session whose
    /// metadata cannot be fetched is reported failed and left out.
    pub(super) async fn phase_catalog(
        &self,
        ledger: &LedgerDocument,
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<SessionKey, SessionCandidates>> {
        let catalog_config = &self.config.catalog;
        let list_secs = self.config.timeouts.metadata_secs;

        tracing::info!(
            prefix = %catalog_config.prefix,
            suffix = %catalog_config.metadata_suffix,
            "Phase 1: CATALOG (listing quality metadata)"
        );

        let objects = tokio::time::timeout(
            qmap_common::time::secs_to_duration(list_secs),
            self.collaborators
                .metadata
                .list(&catalog_config.prefix, &catalog_config.metadata_suffix),
        )
        .await
        .map_err(|_| {
            WorkflowError::Storage(StorageError::Command(format!(
                "metadata listing timed out after {}s",
                list_secs
            )))
        })??;

        let listed = objects.len();
        let index = qc_catalog::group_listing(
            objects,
            catalog_config,
            self.options.min_age_hours,
            summary.started_at,
        );
        summary.too_recent = index.too_recent;
        summary.malformed.extend(index.malformed.iter().cloned());

        tracing::info!(
            objects = listed,
            sessions = index.sessions.len(),
            too_recent = index.too_recent,
            malformed = index.malformed.len(),
            "Metadata listing grouped"
        );

        let required = self.collaborators.ranking.required_fields();
        let fingerprint = self.collaborators.ranking.fingerprint();
        let mut sessions = BTreeMap::new();
        let mut fetched = 0usize;

        for (key, objs) in &index.sessions {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancelled while building catalog");
                summary.cancelled = true;
                break;
            }

            let listed_archives = index.archives(key);
            let status = ledger.status(key);
            let entry = ledger.sessions.get(key);

            if let Some(reason) =
                selection::prefetch_skip(status, entry, &listed_archives, &fingerprint)
            {
                tracing::debug!(session = %key, reason = %reason, "Decided from listing");
                sessions.insert(
                    key.clone(),
                    SessionCandidates {
                        listed_archives,
                        candidates: None,
                    },
                );
                continue;
            }

            let mut candidates = Vec::new();
            let mut failure = None;
            for obj in objs {
                let fetch = self.collaborators.metadata.fetch(&obj.info.key);
                let bytes = match guarded(&self.cancel, Stage::Metadata, list_secs, fetch).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                fetched += 1;

                match qc_catalog::parse_metadata(key, obj, &bytes, catalog_config, &required) {
                    Ok(parsed) => {
                        candidates.extend(parsed.candidates);
                        for err in parsed.malformed {
                            tracing::warn!(key = %obj.info.key, error = %err, "Skipping malformed scan");
                            summary.malformed.push(MalformedReport {
                                metadata_key: obj.info.key.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                    Err(err) => {
                        tracing::warn!(key = %obj.info.key, error = %err, "Skipping malformed metadata");
                        summary.malformed.push(MalformedReport {
                            metadata_key: obj.info.key.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }

            if let Some(e) = failure {
                tracing::warn!(session = %key, error = %e, "Metadata fetch failed, session skipped this run");
                summary.failed.push(FailureReport {
                    session: key.clone(),
                    archive: None,
                    stage: e.stage().to_string(),
                    reason: e.reason(),
                });
                continue;
            }

            sessions.insert(
                key.clone(),
                SessionCandidates {
                    listed_archives,
                    candidates: Some(candidates),
                },
            );
        }

        tracing::info!(
            sessions = sessions.len(),
            fetched,
            "Catalog built"
        );
        Ok(sessions)
    }
}
