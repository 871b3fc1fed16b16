//! qmap-wf library interface
//!
//! Exposes the workflow for the binary and for integration tests.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{DelegationError, Result, Stage, WorkflowError};

/// Crate version plus build identity
pub fn version_string() -> String {
    format!(
        "{} ({} {} {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    )
}
