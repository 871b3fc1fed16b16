//! DICOM-to-BIDS conversion through dcm2bids

use crate::config::ConverterConfig;
use crate::error::ToolError;
use crate::models::SessionKey;
use crate::services::collaborators::{self, BidsConverter, BidsOutput};
use crate::services::command::{self, CommandTemplate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Dcm2BidsConverter {
    template: CommandTemplate,
    vars: BTreeMap<String, String>,
}

impl Dcm2BidsConverter {
    pub fn from_config(config: &ConverterConfig) -> Self {
        Self {
            template: CommandTemplate::new(config.program.clone(), config.args.clone()),
            vars: config.vars.clone(),
        }
    }

    pub fn render_args(&self, maps_dir: &Path, key: &SessionKey, bids_dir: &Path) -> Result<Vec<String>, ToolError> {
        let mut vars = self.vars.clone();
        vars.insert("maps_dir".to_string(), maps_dir.display().to_string());
        vars.insert("subject".to_string(), key.subject.clone());
        vars.insert("session".to_string(), key.session.clone());
        vars.insert("bids_dir".to_string(), bids_dir.display().to_string());
        self.template.render(&vars)
    }
}

#[async_trait]
impl BidsConverter for Dcm2BidsConverter {
    async fn convert(
        &self,
        maps_dir: &Path,
        key: &SessionKey,
        bids_dir: &Path,
        log_path: &Path,
    ) -> Result<BidsOutput, ToolError> {
        tokio::fs::create_dir_all(bids_dir).await?;
        let args = self.render_args(maps_dir, key, bids_dir)?;

        tracing::info!(session = %key, program = %self.template.program, "Converting maps to BIDS");
        command::run_logged(&self.template.program, &args, log_path).await?;

        let output = collaborators::collect_anat_files(bids_dir, key)?;
        // dcm2bids exits 0 even when nothing matched its config
        if output.niftis.is_empty() {
            return Err(ToolError::Output(format!(
                "no NIfTI images under {}",
                output.anat_dir.display()
            )));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_renders() {
        let converter = Dcm2BidsConverter::from_config(&ConverterConfig::default());
        let args = converter
            .render_args(
                Path::new("/w/maps"),
                &SessionKey::new("880852", "V02"),
                Path::new("/w/bids"),
            )
            .unwrap();
        assert_eq!(
            args,
            vec![
                "-d", "/w/maps", "--participant", "880852", "--session", "V02", "-c",
                "dcm2bids_config.json", "-o", "/w/bids",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_conversion_is_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let converter = Dcm2BidsConverter::from_config(&ConverterConfig {
            program: "true".to_string(),
            args: Vec::new(),
            vars: BTreeMap::new(),
        });
        let err = converter
            .convert(
                dir.path(),
                &SessionKey::new("S", "V01"),
                &dir.path().join("bids"),
                &dir.path().join("conv.log"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Output(_)));
    }
}
