//! Storage back ends

pub mod local;
pub mod s3cmd;

pub use local::LocalStore;
pub use s3cmd::S3cmdStore;

use crate::config::StoreConfig;
use crate::services::collaborators::{ArchiveStore, DerivativeSink, MetadataSource};
use std::sync::Arc;

/// One back end viewed through each storage interface
#[derive(Clone)]
pub struct StoreHandles {
    pub metadata: Arc<dyn MetadataSource>,
    pub archives: Arc<dyn ArchiveStore>,
    pub sink: Arc<dyn DerivativeSink>,
}

impl StoreHandles {
    pub fn from_store<T>(store: T) -> Self
    where
        T: MetadataSource + ArchiveStore + DerivativeSink + 'static,
    {
        let store = Arc::new(store);
        Self {
            metadata: store.clone(),
            archives: store.clone(),
            sink: store,
        }
    }
}

/// Build the back end named by `config`
pub fn build_store(config: &StoreConfig) -> StoreHandles {
    match config {
        StoreConfig::Local { root } => {
            tracing::info!(root = %root.display(), "Using local directory store");
            StoreHandles::from_store(LocalStore::new(root.clone()))
        }
        StoreConfig::S3cmd {
            bucket,
            config,
            program,
        } => {
            tracing::info!(bucket = %bucket, "Using s3cmd store");
            StoreHandles::from_store(S3cmdStore::new(program.clone(), config.clone(), bucket.clone()))
        }
    }
}
