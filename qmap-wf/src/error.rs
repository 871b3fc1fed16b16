//! Error types for qmap-wf
//!
//! Three layers:
//! - [`WorkflowError`]: run-fatal conditions (the run stops, exit code 1)
//! - [`DelegationError`]: per-work-item failures (the item is abandoned)
//! - [`CatalogError`]: malformed quality metadata (the record is skipped)

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for run-fatal operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Errors that end the run
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Persisted ledger exists but cannot be parsed
    #[error("Ledger {path} is corrupt: {reason}")]
    LedgerCorrupt { path: PathBuf, reason: String },

    /// Another run holds the lock next to the ledger
    #[error("Another run is already running (lock {path} held by {holder})")]
    AlreadyRunning { path: PathBuf, holder: String },

    /// Quality-metadata listing failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error outside any work item
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// qmap-common error
    #[error("Common error: {0}")]
    Common(qmap_common::Error),
}

impl From<qmap_common::Error> for WorkflowError {
    fn from(err: qmap_common::Error) -> Self {
        match err {
            qmap_common::Error::Locked { path, holder } => {
                WorkflowError::AlreadyRunning { path, holder }
            }
            qmap_common::Error::Config(msg) => WorkflowError::Config(msg),
            other => WorkflowError::Common(other),
        }
    }
}

/// Errors from a storage back end
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Storage client command failed
    #[error("Storage command failed: {0}")]
    Command(String),

    /// Listing output could not be interpreted
    #[error("Unexpected listing output: {0}")]
    Listing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from an external tool invocation
#[derive(Debug, Error)]
pub enum ToolError {
    /// Command template references an unknown placeholder
    #[error("Command template error: {0}")]
    Template(String),

    /// Program could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Program exited unsuccessfully
    #[error("{program} exited with {status} (log: {log})")]
    ExitStatus {
        program: String,
        status: String,
        log: PathBuf,
    },

    /// Program exited successfully but its output is unusable
    #[error("Output check failed: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delegation stage at which a work item failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Download,
    Unpack,
    Locate,
    Processor,
    Converter,
    Sidecar,
    Upload,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Metadata => "metadata",
            Stage::Download => "download",
            Stage::Unpack => "unpack",
            Stage::Locate => "locate",
            Stage::Processor => "processor",
            Stage::Converter => "converter",
            Stage::Sidecar => "sidecar",
            Stage::Upload => "upload",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item failure; the item is abandoned and retried next run
#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("{stage} failed: {message}")]
    Failed { stage: Stage, message: String },

    #[error("{stage} timed out after {secs}s")]
    TimedOut { stage: Stage, secs: u64 },

    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },
}

impl DelegationError {
    pub fn failed(stage: Stage, err: impl fmt::Display) -> Self {
        DelegationError::Failed {
            stage,
            message: err.to_string(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            DelegationError::Failed { stage, .. }
            | DelegationError::TimedOut { stage, .. }
            | DelegationError::Cancelled { stage } => *stage,
        }
    }

    /// Human-readable reason without the stage prefix
    pub fn reason(&self) -> String {
        match self {
            DelegationError::Failed { message, .. } => message.clone(),
            DelegationError::TimedOut { secs, .. } => format!("timed out after {}s", secs),
            DelegationError::Cancelled { .. } => "cancelled".to_string(),
        }
    }
}

/// Why a quality-metadata record was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("object name does not follow <site>_<subject>_<session>...: {0}")]
    UnparseableName(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("no scan objects in metadata body")]
    NoScans,

    #[error("candidate scan is missing field {0}")]
    MissingField(String),

    #[error("field {field} is not numeric")]
    NotNumeric { field: String },
}
