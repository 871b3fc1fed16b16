//! Test harness for run coordinator integration tests
//!
//! Metadata and archives live in a local source store; derivatives go to a
//! local sink. Unpacking, DICOM probing and the external tools are faked.

#![allow(dead_code)]

use async_trait::async_trait;
use qmap_wf::config::{CatalogConfig, StoreConfig, WorkflowConfig};
use qmap_wf::error::{StorageError, ToolError};
use qmap_wf::models::{ArchiveId, SessionKey};
use qmap_wf::services::collaborators::{collect_anat_files, anat_dir};
use qmap_wf::services::ledger::{Ledger, LedgerDocument};
use qmap_wf::services::tracking_log::TrackingLog;
use qmap_wf::services::{
    ArchiveStore, BidsConverter, BidsOutput, Collaborators, FieldRanking, FieldRule, LocalStore,
    Preference, RelaxometryProcessor, RunCoordinator, RunOptions, SeriesInfo, SeriesProbe,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Metadata prefix inside the source store
pub const QC_PREFIX: &str = "qc/";

// ============================================================================
// Fake collaborators
// ============================================================================

/// Local archive store whose unpack lays out a QALAS folder and a T1w folder
pub struct FakeArchives {
    store: LocalStore,
    pub fetched: Mutex<Vec<ArchiveId>>,
}

#[async_trait]
impl ArchiveStore for FakeArchives {
    async fn fetch_archive(&self, archive: &ArchiveId, dest_dir: &Path) -> Result<PathBuf, StorageError> {
        let path = self.store.fetch_archive(archive, dest_dir).await?;
        self.fetched.lock().unwrap().push(archive.clone());
        Ok(path)
    }

    async fn unpack(&self, _archive_path: &Path, dest_dir: &Path) -> Result<(), ToolError> {
        for folder in ["qalas", "t1w"] {
            let dir = dest_dir.join("study").join(folder);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join("IM0001.dcm"), b"dicom")?;
        }
        Ok(())
    }
}

/// Answers from the folder name instead of DICOM headers
pub struct FakeProbe;

impl SeriesProbe for FakeProbe {
    fn probe(&self, folder: &Path) -> Option<SeriesInfo> {
        let description = match folder.file_name()?.to_str()? {
            "qalas" => "QALAS_3D",
            "t1w" => "T1w MPRAGE",
            _ => return None,
        };
        Some(SeriesInfo {
            series_description: Some(description.to_string()),
            series_instance_uid: None,
            study_instance_uid: None,
            patient_name: Some("INFANT^TEST".to_string()),
            patient_id: Some("TEST".to_string()),
        })
    }
}

/// Writes six map files, or fails / hangs on request
#[derive(Default)]
pub struct FakeProcessor {
    pub fail: AtomicBool,
    /// Cancelled on the next call, which then hangs
    pub cancel_on_call: Mutex<Option<CancellationToken>>,
    pub calls: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl RelaxometryProcessor for FakeProcessor {
    async fn generate_maps(
        &self,
        scan_dir: &Path,
        output_dir: &Path,
        log_path: &Path,
    ) -> Result<Vec<PathBuf>, ToolError> {
        self.calls.lock().unwrap().push(scan_dir.to_path_buf());
        std::fs::write(log_path, "container ran\n")?;

        let token = self.cancel_on_call.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ToolError::Output("expected 6 maps, found 0".to_string()));
        }

        std::fs::create_dir_all(output_dir)?;
        let mut maps = Vec::new();
        for i in 0..6 {
            let path = output_dir.join(format!("map{}.dcm", i));
            std::fs::write(&path, b"map")?;
            maps.push(path);
        }
        Ok(maps)
    }
}

/// Writes one NIfTI and one sidecar into the BIDS anat directory
pub struct FakeConverter;

#[async_trait]
impl BidsConverter for FakeConverter {
    async fn convert(
        &self,
        _maps_dir: &Path,
        key: &SessionKey,
        bids_dir: &Path,
        log_path: &Path,
    ) -> Result<BidsOutput, ToolError> {
        std::fs::write(log_path, "converted\n")?;
        let anat = anat_dir(bids_dir, key);
        std::fs::create_dir_all(&anat)?;
        let stem = format!("{}_acq-QALAS_T1map", key.label());
        std::fs::write(anat.join(format!("{}.nii.gz", stem)), b"nifti")?;
        std::fs::write(
            anat.join(format!("{}.json", stem)),
            r#"{"EchoTime": 0.0023, "RepetitionTime": 4.5, "FlipAngle": 4, "Modality": "MR"}"#,
        )?;
        Ok(collect_anat_files(bids_dir, key)?)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub work_root: PathBuf,
    pub source_root: PathBuf,
    pub sink_root: PathBuf,
    pub archives: Arc<FakeArchives>,
    pub processor: Arc<FakeProcessor>,
    pub batch_size: usize,
    pub ranking_rules: Vec<FieldRule>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let work_root = dir.path().join("work");
        let source_root = dir.path().join("source");
        let sink_root = dir.path().join("sink");
        for d in [&work_root, &source_root, &sink_root] {
            std::fs::create_dir_all(d).unwrap();
        }
        std::fs::create_dir_all(source_root.join(QC_PREFIX)).unwrap();

        let archives = Arc::new(FakeArchives {
            store: LocalStore::new(&source_root),
            fetched: Mutex::new(Vec::new()),
        });
        Self {
            dir,
            work_root,
            source_root,
            sink_root,
            archives,
            processor: Arc::new(FakeProcessor::default()),
            batch_size: 20,
            ranking_rules: vec![FieldRule::new("quality", Preference::Higher)],
        }
    }

    /// Add a QALAS scan with the given quality; returns its archive
    pub fn add_scan(&self, subject: &str, session: &str, tag: &str, quality: f64) -> ArchiveId {
        let body = format!(
            r#"[{{"SeriesType": "qMRI", "Completed": 1, "quality": {}}}]"#,
            quality
        );
        self.add_metadata(subject, session, tag, &body)
    }

    /// Add a metadata object with a raw body; returns its archive
    pub fn add_metadata(&self, subject: &str, session: &str, tag: &str, body: &str) -> ArchiveId {
        let base = format!("{}UMN_{}_{}_{}", QC_PREFIX, subject, session, tag);
        let config = CatalogConfig::default();
        std::fs::write(
            self.source_root.join(format!("{}{}", base, config.metadata_suffix)),
            body,
        )
        .unwrap();
        std::fs::write(
            self.source_root.join(format!("{}{}", base, config.archive_suffix)),
            b"archive",
        )
        .unwrap();
        ArchiveId::new(format!("{}{}", base, config.archive_suffix))
    }

    pub fn config(&self) -> WorkflowConfig {
        let mut config = WorkflowConfig::default();
        config.work_root = Some(self.work_root.clone());
        config.batch_size = self.batch_size;
        config.source = StoreConfig::Local {
            root: self.source_root.clone(),
        };
        config.sink = StoreConfig::Local {
            root: self.sink_root.clone(),
        };
        config.catalog.prefix = QC_PREFIX.to_string();
        config.ranking.rules = self.ranking_rules.clone();
        config.timeouts.processor_secs = 10;
        config
    }

    pub fn collaborators(&self, config: &WorkflowConfig) -> Collaborators {
        Collaborators {
            metadata: Arc::new(LocalStore::new(&self.source_root)),
            archives: self.archives.clone(),
            sink: Arc::new(LocalStore::new(&self.sink_root)),
            processor: self.processor.clone(),
            converter: Arc::new(FakeConverter),
            probe: Arc::new(FakeProbe),
            ranking: Arc::new(FieldRanking::new(config.ranking.rules.clone())),
        }
    }

    pub fn coordinator(&self, dry_run: bool, cancel: CancellationToken) -> RunCoordinator {
        let config = self.config();
        let mut options = RunOptions::from_config(&config, self.work_root.clone());
        options.dry_run = dry_run;
        let collaborators = self.collaborators(&config);
        RunCoordinator::new(config, options, collaborators, cancel)
    }

    pub fn ledger_path(&self) -> PathBuf {
        Ledger::path_in(&self.work_root)
    }

    pub fn ledger(&self) -> LedgerDocument {
        Ledger::read(&self.ledger_path()).unwrap().unwrap()
    }

    /// Apply an operator edit to the ledger file
    pub fn edit_ledger<F: FnOnce(&mut LedgerDocument)>(&self, edit: F) {
        let mut doc = Ledger::read(&self.ledger_path()).unwrap().unwrap_or_default();
        edit(&mut doc);
        qmap_common::config::write_toml(&doc, &self.ledger_path()).unwrap();
    }

    pub fn tracking_log(&self) -> TrackingLog {
        TrackingLog::in_work_root(&self.work_root)
    }

    /// Raw bytes of a file, `None` when absent
    pub fn snapshot(path: &Path) -> Option<Vec<u8>> {
        std::fs::read(path).ok()
    }
}

pub fn key(subject: &str, session: &str) -> SessionKey {
    SessionKey::new(subject, session)
}
