//! Scan folder location inside an unpacked archive
//!
//! Archives hold one folder per series. The QALAS folder is the terminal
//! folder whose DICOM headers name a QALAS (or MAGiC) series and, when the
//! selected record knows them, carry the same series and study UIDs.

use crate::models::QcRecord;
use crate::services::collaborators::{SeriesInfo, SeriesProbe};
use dicom_dictionary_std::tags;
use dicom_object::OpenFileOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Series description markers of QALAS acquisitions
const QALAS_MARKERS: [&str; 2] = ["QALAS", "MAGIC"];

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no terminal folders under {0}")]
    Empty(PathBuf),

    #[error("no QALAS folder matches the selected scan")]
    NoMatch,

    #[error("{} folders match the selected scan: {}", .0.len(), display_paths(.0))]
    Ambiguous(Vec<PathBuf>),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Leaf directories holding at least one file, sorted
pub fn terminal_folders(root: &Path) -> Vec<PathBuf> {
    let mut folders = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(children) = std::fs::read_dir(entry.path()) else {
            continue;
        };
        let mut has_file = false;
        let mut has_dir = false;
        for child in children.filter_map(|c| c.ok()) {
            match child.file_type() {
                Ok(t) if t.is_dir() => has_dir = true,
                Ok(t) if t.is_file() => has_file = true,
                _ => {}
            }
        }
        if has_file && !has_dir {
            folders.push(entry.into_path());
        }
    }
    folders.sort();
    folders
}

/// Whether probed headers identify the selected scan
pub fn matches_selection(info: &SeriesInfo, record: &QcRecord) -> bool {
    let description = info
        .series_description
        .as_deref()
        .unwrap_or_default()
        .to_uppercase();
    if !QALAS_MARKERS.iter().any(|m| description.contains(m)) {
        return false;
    }

    let uid_matches = |expected: &Option<String>, found: &Option<String>| match (expected, found) {
        (Some(e), Some(f)) => e == f,
        (Some(_), None) => false,
        (None, _) => true,
    };
    uid_matches(&record.series_instance_uid, &info.series_instance_uid)
        && uid_matches(&record.study_instance_uid, &info.study_instance_uid)
}

/// Find the single folder holding the selected scan
pub fn locate_scan_folder(
    root: &Path,
    probe: &dyn SeriesProbe,
    record: &QcRecord,
) -> Result<(PathBuf, SeriesInfo), LocateError> {
    let folders = terminal_folders(root);
    if folders.is_empty() {
        return Err(LocateError::Empty(root.to_path_buf()));
    }

    let mut matches: Vec<(PathBuf, SeriesInfo)> = folders
        .into_iter()
        .filter_map(|folder| {
            let info = probe.probe(&folder)?;
            matches_selection(&info, record).then_some((folder, info))
        })
        .collect();

    match matches.len() {
        0 => Err(LocateError::NoMatch),
        1 => Ok(matches.remove(0)),
        _ => Err(LocateError::Ambiguous(
            matches.into_iter().map(|(folder, _)| folder).collect(),
        )),
    }
}

/// Reads headers of up to `max_files` DICOM files per folder
#[derive(Debug, Clone)]
pub struct DicomSeriesProbe {
    max_files: usize,
}

impl Default for DicomSeriesProbe {
    fn default() -> Self {
        Self { max_files: 5 }
    }
}

impl DicomSeriesProbe {
    pub fn new(max_files: usize) -> Self {
        Self {
            max_files: max_files.max(1),
        }
    }

    fn read_header(path: &Path) -> Option<SeriesInfo> {
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)
            .ok()?;

        let text = |tag| {
            obj.element(tag)
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
                .filter(|s| !s.is_empty())
        };

        Some(SeriesInfo {
            series_description: text(tags::SERIES_DESCRIPTION),
            series_instance_uid: text(tags::SERIES_INSTANCE_UID),
            study_instance_uid: text(tags::STUDY_INSTANCE_UID),
            patient_name: text(tags::PATIENT_NAME),
            patient_id: text(tags::PATIENT_ID),
        })
    }
}

impl SeriesProbe for DicomSeriesProbe {
    fn probe(&self, folder: &Path) -> Option<SeriesInfo> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(folder)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();

        files
            .iter()
            .take(self.max_files)
            .find_map(|path| Self::read_header(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchiveId, QualityScore, SessionKey};
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Probe answering from a folder-name table
    struct TableProbe(HashMap<String, SeriesInfo>);

    impl SeriesProbe for TableProbe {
        fn probe(&self, folder: &Path) -> Option<SeriesInfo> {
            let name = folder.file_name()?.to_string_lossy().into_owned();
            self.0.get(&name).cloned()
        }
    }

    fn info(description: &str, series: &str) -> SeriesInfo {
        SeriesInfo {
            series_description: Some(description.to_string()),
            series_instance_uid: Some(series.to_string()),
            study_instance_uid: Some("1.2".to_string()),
            patient_name: Some("INFANT^TEST".to_string()),
            patient_id: Some("880852".to_string()),
        }
    }

    fn record(series: Option<&str>) -> QcRecord {
        QcRecord {
            key: SessionKey::new("880852", "V02"),
            scan_type: "qMRI".to_string(),
            archive: ArchiveId::new("A.tar.gz"),
            series_instance_uid: series.map(str::to_string),
            study_instance_uid: Some("1.2".to_string()),
            completed: true,
            score: QualityScore::default(),
            metadata_key: "A.json".to_string(),
        }
    }

    fn tree(folders: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for folder in folders {
            let path = dir.path().join("study").join(folder);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join("IM0001.dcm"), b"x").unwrap();
        }
        dir
    }

    #[test]
    fn test_terminal_folders_skip_empty_and_inner() {
        let dir = tree(&["t1", "qalas"]);
        std::fs::create_dir_all(dir.path().join("study").join("empty")).unwrap();
        let folders = terminal_folders(dir.path());
        assert_eq!(
            folders,
            vec![dir.path().join("study/qalas"), dir.path().join("study/t1")]
        );
    }

    #[test]
    fn test_locate_by_description_and_uid() {
        let dir = tree(&["s1", "s2", "s3"]);
        let probe = TableProbe(HashMap::from([
            ("s1".to_string(), info("T1w MPRAGE", "1.2.1")),
            ("s2".to_string(), info("QALAS_3D", "1.2.2")),
            ("s3".to_string(), info("qalas_3d repeat", "1.2.3")),
        ]));

        let (folder, found) = locate_scan_folder(dir.path(), &probe, &record(Some("1.2.3"))).unwrap();
        assert_eq!(folder, dir.path().join("study/s3"));
        assert_eq!(found.patient_id.as_deref(), Some("880852"));

        // Without a series uid both QALAS folders match
        let err = locate_scan_folder(dir.path(), &probe, &record(None)).unwrap_err();
        assert!(matches!(err, LocateError::Ambiguous(ref v) if v.len() == 2));
    }

    #[test]
    fn test_locate_no_match() {
        let dir = tree(&["s1"]);
        let probe = TableProbe(HashMap::from([("s1".to_string(), info("MAGiC", "9.9"))]));
        assert!(matches!(
            locate_scan_folder(dir.path(), &probe, &record(Some("1.2.3"))),
            Err(LocateError::NoMatch)
        ));
    }

    #[test]
    fn test_dicom_probe_ignores_non_dicom() {
        let dir = tree(&["s1"]);
        let probe = DicomSeriesProbe::default();
        assert!(probe.probe(&dir.path().join("study/s1")).is_none());
    }
}
