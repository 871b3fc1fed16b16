//! Interfaces to the external collaborators driven by the run coordinator
//!
//! Storage back ends implement [`MetadataSource`], [`ArchiveStore`] and
//! [`DerivativeSink`]; the processing tools implement
//! [`RelaxometryProcessor`] and [`BidsConverter`]; DICOM header probing is
//! behind [`SeriesProbe`].

use crate::error::{StorageError, ToolError};
use crate::models::{ArchiveId, SessionKey};
use crate::services::command;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// A listed storage object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Quality-metadata source: list by suffix, fetch bytes
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Every object under `prefix` whose key ends with `suffix`
    async fn list(&self, prefix: &str, suffix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// DICOM archive store
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Download `archive` into `dest_dir`, returning the local file
    async fn fetch_archive(&self, archive: &ArchiveId, dest_dir: &Path) -> Result<PathBuf, StorageError>;

    /// Unpack a downloaded archive into `dest_dir`
    async fn unpack(&self, archive_path: &Path, dest_dir: &Path) -> Result<(), ToolError> {
        command::unpack_tar_gz(archive_path, dest_dir).await
    }
}

/// Destination for derivative files
#[async_trait]
pub trait DerivativeSink: Send + Sync {
    /// Upload `files` (relative to `base`) under `prefix`, keeping their
    /// relative paths. Returns the number of files uploaded.
    async fn upload(&self, base: &Path, files: &[PathBuf], prefix: &str) -> Result<usize, StorageError>;
}

/// Relaxometry map generator
#[async_trait]
pub trait RelaxometryProcessor: Send + Sync {
    /// Generate maps from `scan_dir` into `output_dir`, logging to `log_path`.
    /// Returns the generated entries.
    async fn generate_maps(
        &self,
        scan_dir: &Path,
        output_dir: &Path,
        log_path: &Path,
    ) -> Result<Vec<PathBuf>, ToolError>;
}

/// BIDS tree produced by a converter for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BidsOutput {
    /// `<bids_dir>/sub-<S>/ses-<V>/anat`
    pub anat_dir: PathBuf,
    pub niftis: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
}

/// DICOM-to-BIDS converter
#[async_trait]
pub trait BidsConverter: Send + Sync {
    async fn convert(
        &self,
        maps_dir: &Path,
        key: &SessionKey,
        bids_dir: &Path,
        log_path: &Path,
    ) -> Result<BidsOutput, ToolError>;
}

/// Identity read from the DICOM headers of a folder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesInfo {
    pub series_description: Option<String>,
    pub series_instance_uid: Option<String>,
    pub study_instance_uid: Option<String>,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
}

/// Reads series identity from a folder of DICOM files
pub trait SeriesProbe: Send + Sync {
    /// `None` when no file in the folder is readable DICOM
    fn probe(&self, folder: &Path) -> Option<SeriesInfo>;
}

/// Files of a BIDS session's `anat` directory
pub fn collect_anat_files(bids_dir: &Path, key: &SessionKey) -> std::io::Result<BidsOutput> {
    let anat_dir = anat_dir(bids_dir, key);
    let mut output = BidsOutput {
        anat_dir: anat_dir.clone(),
        ..Default::default()
    };
    if !anat_dir.is_dir() {
        return Ok(output);
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(&anat_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    for path in entries {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(".nii.gz") || name.ends_with(".nii") {
            output.niftis.push(path);
        } else if name.ends_with(".json") {
            output.sidecars.push(path);
        }
    }
    Ok(output)
}

/// `<bids_dir>/sub-<S>/ses-<V>/anat`
pub fn anat_dir(bids_dir: &Path, key: &SessionKey) -> PathBuf {
    bids_dir
        .join(format!("sub-{}", key.subject))
        .join(format!("ses-{}", key.session))
        .join("anat")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_anat_files_sorts_by_kind() {
        let dir = TempDir::new().unwrap();
        let key = SessionKey::new("S", "V01");
        let anat = anat_dir(dir.path(), &key);
        std::fs::create_dir_all(&anat).unwrap();
        for name in ["b_T1map.nii.gz", "a_T1map.nii.gz", "a_T1map.json", "notes.txt"] {
            std::fs::write(anat.join(name), b"x").unwrap();
        }

        let output = collect_anat_files(dir.path(), &key).unwrap();
        assert_eq!(output.anat_dir, anat);
        assert_eq!(output.niftis, vec![anat.join("a_T1map.nii.gz"), anat.join("b_T1map.nii.gz")]);
        assert_eq!(output.sidecars, vec![anat.join("a_T1map.json")]);
    }

    #[test]
    fn test_collect_anat_files_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let output = collect_anat_files(dir.path(), &SessionKey::new("S", "V01")).unwrap();
        assert!(output.niftis.is_empty());
        assert!(output.sidecars.is_empty());
    }
}
