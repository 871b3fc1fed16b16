//! # qmap common library
//!
//! Shared code for the qmap workflow crates:
//! - Error type
//! - Configuration file and work root resolution
//! - Atomic file writes and content digests
//! - Exclusive run lock
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod time;

pub use error::{Error, Result};
pub use lock::RunLock;
