//! BIDS sidecar metadata injection
//!
//! The converter copies acquisition parameters of the synthetic maps from
//! their DICOM headers, which describe the container's output rather than
//! the QALAS acquisition. Those fields are removed and identity plus
//! provenance fields are added.

use crate::config::SidecarConfig;
use crate::models::{QcRecord, SessionKey};
use crate::services::collaborators::{BidsOutput, SeriesInfo};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct SidecarInjector {
    config: SidecarConfig,
}

impl SidecarInjector {
    pub fn new(config: SidecarConfig) -> Self {
        Self { config }
    }

    /// Fields added to every sidecar. Probed UIDs win over the QC record's.
    pub fn supplemental_fields(&self, info: &SeriesInfo, record: &QcRecord) -> Map<String, Value> {
        let mut fields = Map::new();
        let series = info
            .series_instance_uid
            .clone()
            .or_else(|| record.series_instance_uid.clone());
        let study = info
            .study_instance_uid
            .clone()
            .or_else(|| record.study_instance_uid.clone());

        for (name, value) in [
            ("SeriesInstanceUID", series),
            ("StudyInstanceUID", study),
            ("PatientName", info.patient_name.clone()),
            ("PatientID", info.patient_id.clone()),
        ] {
            if let Some(v) = value {
                fields.insert(name.to_string(), Value::String(v));
            }
        }

        fields.insert(
            "DerivativeDetails".to_string(),
            json!({
                "ImageDescription": self.config.description,
                "ReferenceDOIs": self.config.reference_dois,
            }),
        );
        fields
    }

    /// Rewrite one sidecar in place
    pub fn inject(&self, path: &Path, supplemental: &Map<String, Value>) -> Result<(), SidecarError> {
        let io_err = |source| SidecarError::Io {
            path: path.to_path_buf(),
            source,
        };
        let content = std::fs::read(path).map_err(io_err)?;
        let mut value: Value = serde_json::from_slice(&content).map_err(|e| SidecarError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let Some(obj) = value.as_object_mut() else {
            return Err(SidecarError::Invalid {
                path: path.to_path_buf(),
                reason: "sidecar is not a JSON object".to_string(),
            });
        };

        for field in &self.config.removed_fields {
            obj.remove(field);
        }
        for (k, v) in supplemental {
            obj.insert(k.clone(), v.clone());
        }

        let text = serde_json::to_string_pretty(&value).map_err(|e| SidecarError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(io_err)
    }

    /// Inject every sidecar of a converted session and copy the processor log
    /// next to them. Returns the number of sidecars rewritten.
    pub fn apply(
        &self,
        output: &BidsOutput,
        key: &SessionKey,
        info: &SeriesInfo,
        record: &QcRecord,
        processor_log: &Path,
    ) -> Result<usize, SidecarError> {
        let supplemental = self.supplemental_fields(info, record);
        for sidecar in &output.sidecars {
            self.inject(sidecar, &supplemental)?;
        }

        let log_dest = output.anat_dir.join(processor_log_name(key));
        std::fs::copy(processor_log, &log_dest).map_err(|source| SidecarError::Io {
            path: processor_log.to_path_buf(),
            source,
        })?;

        tracing::debug!(
            session = %key,
            sidecars = output.sidecars.len(),
            "Sidecars updated"
        );
        Ok(output.sidecars.len())
    }
}

/// `sub-<S>_ses-<V>_acq-QALAS_desc-SymriContainer.log`
pub fn processor_log_name(key: &SessionKey) -> String {
    format!("{}_acq-QALAS_desc-SymriContainer.log", key.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchiveId, QualityScore};
    use crate::services::collaborators::anat_dir;
    use tempfile::TempDir;

    fn record() -> QcRecord {
        QcRecord {
            key: SessionKey::new("880852", "V02"),
            scan_type: "qMRI".to_string(),
            archive: ArchiveId::new("A.tar.gz"),
            series_instance_uid: Some("1.2.3".to_string()),
            study_instance_uid: Some("1.2".to_string()),
            completed: true,
            score: QualityScore::default(),
            metadata_key: "A.json".to_string(),
        }
    }

    fn info() -> SeriesInfo {
        SeriesInfo {
            series_description: Some("QALAS".to_string()),
            series_instance_uid: None,
            study_instance_uid: Some("1.2".to_string()),
            patient_name: Some("INFANT^TEST".to_string()),
            patient_id: Some("880852".to_string()),
        }
    }

    #[test]
    fn test_apply_rewrites_sidecars_and_copies_log() {
        let dir = TempDir::new().unwrap();
        let key = SessionKey::new("880852", "V02");
        let anat = anat_dir(&dir.path().join("bids"), &key);
        std::fs::create_dir_all(&anat).unwrap();

        let sidecar = anat.join("sub-880852_ses-V02_T1map.json");
        std::fs::write(
            &sidecar,
            r#"{"EchoTime": 0.002, "RepetitionTime": 4.8, "FlipAngle": 4, "Modality": "MR"}"#,
        )
        .unwrap();
        let log = dir.path().join("processor.log");
        std::fs::write(&log, "container output").unwrap();

        let output = BidsOutput {
            anat_dir: anat.clone(),
            niftis: Vec::new(),
            sidecars: vec![sidecar.clone()],
        };
        let injector = SidecarInjector::new(SidecarConfig::default());
        assert_eq!(injector.apply(&output, &key, &info(), &record(), &log).unwrap(), 1);

        let value: Value = serde_json::from_slice(&std::fs::read(&sidecar).unwrap()).unwrap();
        assert!(value.get("EchoTime").is_none());
        assert!(value.get("FlipAngle").is_none());
        assert_eq!(value["Modality"], "MR");
        // Falls back to the QC record when the probe has no series uid
        assert_eq!(value["SeriesInstanceUID"], "1.2.3");
        assert_eq!(value["PatientID"], "880852");
        assert!(value["DerivativeDetails"]["ReferenceDOIs"].is_array());

        let copied = anat.join("sub-880852_ses-V02_acq-QALAS_desc-SymriContainer.log");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "container output");
    }

    #[test]
    fn test_non_object_sidecar_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let injector = SidecarInjector::new(SidecarConfig::default());
        assert!(matches!(
            injector.inject(&path, &Map::new()),
            Err(SidecarError::Invalid { .. })
        ));
    }
}
