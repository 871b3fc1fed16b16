//! Relaxometry map generation through an external container

use crate::config::ProcessorConfig;
use crate::error::ToolError;
use crate::services::collaborators::RelaxometryProcessor;
use crate::services::command::{self, CommandTemplate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Runs the configured container command for one scan folder
#[derive(Debug, Clone)]
pub struct ContainerProcessor {
    template: CommandTemplate,
    vars: BTreeMap<String, String>,
    expected_map_count: usize,
}

impl ContainerProcessor {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            template: CommandTemplate::new(config.program.clone(), config.args.clone()),
            vars: config.vars.clone(),
            expected_map_count: config.expected_map_count,
        }
    }

    /// Arguments for one invocation
    pub fn render_args(&self, scan_dir: &Path, output_dir: &Path, log_path: &Path) -> Result<Vec<String>, ToolError> {
        let mut vars = self.vars.clone();
        vars.insert("scan_dir".to_string(), scan_dir.display().to_string());
        vars.insert("output_dir".to_string(), output_dir.display().to_string());
        vars.insert("log_path".to_string(), log_path.display().to_string());
        self.template.render(&vars)
    }
}

/// Entries of `output_dir`, which must number exactly `expected`
pub fn check_map_count(output_dir: &Path, expected: usize) -> Result<Vec<PathBuf>, ToolError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(output_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    if entries.len() != expected {
        return Err(ToolError::Output(format!(
            "expected {} maps in {}, found {}",
            expected,
            output_dir.display(),
            entries.len()
        )));
    }
    Ok(entries)
}

#[async_trait]
impl RelaxometryProcessor for ContainerProcessor {
    async fn generate_maps(
        &self,
        scan_dir: &Path,
        output_dir: &Path,
        log_path: &Path,
    ) -> Result<Vec<PathBuf>, ToolError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let args = self.render_args(scan_dir, output_dir, log_path)?;

        tracing::info!(
            scan_dir = %scan_dir.display(),
            program = %self.template.program,
            "Generating relaxometry maps"
        );
        command::run_logged(&self.template.program, &args, log_path).await?;

        check_map_count(output_dir, self.expected_map_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_command_renders() {
        let processor = ContainerProcessor::from_config(&ProcessorConfig::default());
        let args = processor
            .render_args(Path::new("/w/qalas"), Path::new("/w/maps"), Path::new("/w/p.log"))
            .unwrap();
        assert!(args.contains(&"/w/qalas:/input".to_string()));
        assert!(args.contains(&"/w/maps:/output".to_string()));
        assert!(args.contains(&"symri.sif".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("infant brain"));
    }

    #[test]
    fn test_check_map_count() {
        let dir = TempDir::new().unwrap();
        for n in 0..6 {
            std::fs::write(dir.path().join(format!("map{}.dcm", n)), b"x").unwrap();
        }
        assert_eq!(check_map_count(dir.path(), 6).unwrap().len(), 6);
        assert!(matches!(check_map_count(dir.path(), 5), Err(ToolError::Output(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_maps_with_shell_stand_in() {
        let dir = TempDir::new().unwrap();
        let config = ProcessorConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "for n in 1 2 3; do touch {output_dir}/map$n; done; echo done".to_string(),
            ],
            vars: BTreeMap::new(),
            expected_map_count: 3,
        };
        let processor = ContainerProcessor::from_config(&config);
        let out = dir.path().join("maps");
        let log = dir.path().join("processor.log");

        let maps = processor
            .generate_maps(dir.path(), &out, &log)
            .await
            .unwrap();
        assert_eq!(maps.len(), 3);
        assert!(std::fs::read_to_string(&log).unwrap().contains("done"));
    }
}
