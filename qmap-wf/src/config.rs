//! Workflow configuration
//!
//! Loaded from `qmap-wf.toml` (see [`qmap_common::config::resolve_config_path`]).
//! Every section has defaults so an empty file, or no file at all, is valid
//! apart from the storage sections which must name real locations.

use crate::error::{Result, WorkflowError};
use crate::services::ranking::{FieldRule, Preference};
use qmap_common::config::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Module name used for config file discovery
pub const MODULE_NAME: &str = "qmap-wf";

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Work root (ledger, tracking log, scratch); CLI and env take priority
    #[serde(default)]
    pub work_root: Option<PathBuf>,

    /// Maximum work items executed per run
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Metadata objects younger than this are ignored for the run
    #[serde(default)]
    pub min_age_hours: u64,

    /// Keep per-item scratch directories after the item finishes
    #[serde(default)]
    pub keep_work_dirs: bool,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where quality metadata and DICOM archives are read from
    #[serde(default)]
    pub source: StoreConfig,

    /// Where derivatives are uploaded to
    #[serde(default)]
    pub sink: StoreConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub ranking: RankingConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub converter: ConverterConfig,

    #[serde(default)]
    pub sidecar: SidecarConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            batch_size: default_batch_size(),
            min_age_hours: 0,
            keep_work_dirs: false,
            logging: LoggingConfig::default(),
            source: StoreConfig::default(),
            sink: StoreConfig::default(),
            catalog: CatalogConfig::default(),
            ranking: RankingConfig::default(),
            processor: ProcessorConfig::default(),
            converter: ConverterConfig::default(),
            sidecar: SidecarConfig::default(),
            upload: UploadConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_batch_size() -> usize {
    20
}

impl WorkflowConfig {
    /// Load from `path`, or defaults when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: WorkflowConfig = match path {
            Some(p) => qmap_common::config::load_toml(p)?,
            None => WorkflowConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(WorkflowError::Config("batch_size must be at least 1".into()));
        }
        if self.catalog.metadata_suffix.is_empty() {
            return Err(WorkflowError::Config(
                "catalog.metadata_suffix must not be empty".into(),
            ));
        }
        if self.ranking.rules.is_empty() {
            return Err(WorkflowError::Config(
                "ranking.rules must name at least one field".into(),
            ));
        }
        if self.processor.program.trim().is_empty() || self.converter.program.trim().is_empty() {
            return Err(WorkflowError::Config(
                "processor.program and converter.program must be set".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage back end selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StoreConfig {
    /// Keys are paths relative to `root`
    Local { root: PathBuf },
    /// Shell out to `s3cmd -c <config>` against `s3://<bucket>/`
    S3cmd {
        bucket: String,
        #[serde(default)]
        config: Option<PathBuf>,
        #[serde(default = "default_s3cmd_program")]
        program: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Local {
            root: PathBuf::from("."),
        }
    }
}

fn default_s3cmd_program() -> String {
    "s3cmd".to_string()
}

// ============================================================================
// Catalog and ranking
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Only keys under this prefix are listed
    pub prefix: String,
    /// Suffix identifying quality-metadata objects
    pub metadata_suffix: String,
    /// Replaces `metadata_suffix` to form the archive key
    pub archive_suffix: String,
    /// `SeriesType` value of QALAS scans
    pub qalas_series_type: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            metadata_suffix: "_mripcqc_info.json".to_string(),
            archive_suffix: ".tar.gz".to_string(),
            qalas_series_type: "qMRI".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RankingConfig {
    /// Applied in order; later rules only break ties of earlier ones
    pub rules: Vec<FieldRule>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                FieldRule::new("QU_motion", Preference::Lower),
                FieldRule::new("aqc_motion", Preference::Lower),
            ],
        }
    }
}

// ============================================================================
// External tools
// ============================================================================

/// Relaxometry map generator invocation.
///
/// Placeholders: `{scan_dir}`, `{output_dir}`, `{log_path}` plus every key
/// of `vars`. Standard output and error go to `{log_path}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub vars: BTreeMap<String, String>,
    /// Number of entries the output directory must hold on success
    pub expected_map_count: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        let args = [
            "run",
            "-B",
            "{global_ini}:/opt/symri/bin/global.ini",
            "-B",
            "{layout}:/layout_path",
            "-B",
            "{scan_dir}:/input",
            "-B",
            "{output_dir}:/output",
            "{container}",
            "--batch-mode",
            "--dataset",
            "/input",
            "--output",
            "/output",
            "--layout",
            "/layout_path",
            "--force-anatomy",
            "infant brain",
        ];
        let mut vars = BTreeMap::new();
        vars.insert("container".to_string(), "symri.sif".to_string());
        vars.insert("global_ini".to_string(), "global.ini".to_string());
        vars.insert("layout".to_string(), "layout.json".to_string());
        Self {
            program: "singularity".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            vars,
            expected_map_count: 6,
        }
    }
}

/// DICOM-to-BIDS converter invocation.
///
/// Placeholders: `{maps_dir}`, `{subject}`, `{session}`, `{bids_dir}` plus
/// every key of `vars`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    pub program: String,
    pub args: Vec<String>,
    pub vars: BTreeMap<String, String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        let args = [
            "-d",
            "{maps_dir}",
            "--participant",
            "{subject}",
            "--session",
            "{session}",
            "-c",
            "{dcm2bids_config}",
            "-o",
            "{bids_dir}",
        ];
        let mut vars = BTreeMap::new();
        vars.insert("dcm2bids_config".to_string(), "dcm2bids_config.json".to_string());
        Self {
            program: "dcm2bids".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            vars,
        }
    }
}

// ============================================================================
// Sidecars and upload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SidecarConfig {
    /// Fields removed from every sidecar
    pub removed_fields: Vec<String>,
    /// `DerivativeDetails.ImageDescription`
    pub description: String,
    /// `DerivativeDetails.ReferenceDOIs`
    pub reference_dois: Vec<String>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            removed_fields: vec![
                "EchoTime".to_string(),
                "RepetitionTime".to_string(),
                "FlipAngle".to_string(),
            ],
            description: "This is a synthetic image derived from a QALAS scan distributed by \
                          SyMRI.\nQuantitative T1, T2, and PD values are estimated from the QALAS \
                          scan using numerical algorithms provided by SyMRI."
                .to_string(),
            reference_dois: vec!["https://doi.org/10.1016/j.mri.2019.08.031".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Destination prefix; `{subject}` and `{session}` are substituted
    pub prefix_template: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            prefix_template: "derivatives/ses-{session}/symri".to_string(),
        }
    }
}

/// Per-stage delegation timeouts in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub metadata_secs: u64,
    pub download_secs: u64,
    pub unpack_secs: u64,
    pub processor_secs: u64,
    pub converter_secs: u64,
    pub upload_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            metadata_secs: 120,
            download_secs: 3600,
            unpack_secs: 1800,
            processor_secs: 4 * 3600,
            converter_secs: 1800,
            upload_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: WorkflowConfig = toml::from_str("").unwrap();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.min_age_hours, 0);
        assert_eq!(config.processor.expected_map_count, 6);
        assert_eq!(config.catalog.qalas_series_type, "qMRI");
        assert_eq!(config.ranking.rules.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_variants_parse() {
        let config: WorkflowConfig = toml::from_str(
            r#"
            [source]
            kind = "s3cmd"
            bucket = "raw-bucket"
            config = "/home/u/.s3cfg"

            [sink]
            kind = "local"
            root = "/mnt/derivatives"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.source,
            StoreConfig::S3cmd {
                bucket: "raw-bucket".to_string(),
                config: Some(PathBuf::from("/home/u/.s3cfg")),
                program: "s3cmd".to_string(),
            }
        );
        assert_eq!(
            config.sink,
            StoreConfig::Local {
                root: PathBuf::from("/mnt/derivatives")
            }
        );
    }

    #[test]
    fn test_ranking_rules_parse() {
        let config: WorkflowConfig = toml::from_str(
            r#"
            [ranking]
            rules = [
                { field = "snr", prefer = "higher" },
                { field = "QU_motion", prefer = "lower" },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(config.ranking.rules[0], FieldRule::new("snr", Preference::Higher));
        assert_eq!(config.ranking.rules[1], FieldRule::new("QU_motion", Preference::Lower));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config: WorkflowConfig = toml::from_str("batch_size = 0").unwrap();
        assert!(matches!(config.validate(), Err(WorkflowError::Config(_))));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<WorkflowConfig>("batchsize = 3").is_err());
    }
}
