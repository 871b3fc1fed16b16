//! Configuration loading and work root resolution

use crate::{fsutil, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "QMAP_CONFIG";

/// Environment variable naming the work root
pub const WORK_ROOT_ENV_VAR: &str = "QMAP_WORK_ROOT";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Work root resolution in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config value
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_work_root(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    // Priority 4: OS-dependent compiled default
    default_work_root()
}

/// Locate the TOML config file for a module.
///
/// An explicit path (CLI, then `QMAP_CONFIG`) must exist. Otherwise the
/// per-user file `<config_dir>/qmap/<module>.toml` is tried, then
/// `/etc/qmap/<module>.toml` on Linux. `Ok(None)` means run on defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>, module_name: &str) -> Result<Option<PathBuf>> {
    let explicit = cli_arg
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));

    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(Some(path));
        }
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let file_name = format!("{}.toml", module_name);
    if let Some(user_config) = dirs::config_dir().map(|d| d.join("qmap").join(&file_name)) {
        if user_config.is_file() {
            return Ok(Some(user_config));
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/qmap").join(&file_name);
        if system_config.is_file() {
            return Ok(Some(system_config));
        }
    }

    Ok(None)
}

/// Read and deserialize a TOML file
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Serialize a value as TOML and write it atomically
pub fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(value)?;
    fsutil::write_atomic(path, content.as_bytes())
}

/// Get OS-dependent default work root
pub fn default_work_root() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/qmap (or /var/lib/qmap for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("qmap"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/qmap"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("qmap"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/qmap"))
    } else {
        dirs::data_local_dir()
            .map(|d| d.join("qmap"))
            .unwrap_or_else(|| PathBuf::from("./qmap_data"))
    }
}
