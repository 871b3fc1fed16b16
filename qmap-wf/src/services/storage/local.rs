//! Local directory store
//!
//! Keys are `/`-separated paths relative to a root directory (a mounted
//! bucket or a mirror). Last-modified times come from file mtimes.

use crate::error::StorageError;
use crate::models::ArchiveId;
use crate::services::collaborators::{ArchiveStore, DerivativeSink, MetadataSource, ObjectInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Store backed by a local directory tree
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root, rejecting keys that escape it
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

fn to_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn list_blocking(root: &Path, prefix: &str, suffix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
    if !root.is_dir() {
        return Err(StorageError::Listing(format!(
            "store root {} is not a directory",
            root.display()
        )));
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| StorageError::Listing(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(key) = to_key(root, entry.path()) else {
            continue;
        };
        if !key.starts_with(prefix) || !key.ends_with(suffix) {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| StorageError::Listing(e.to_string()))?
            .modified()?;
        objects.push(ObjectInfo {
            key,
            last_modified: DateTime::<Utc>::from(modified),
        });
    }
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[async_trait]
impl MetadataSource for LocalStore {
    async fn list(&self, prefix: &str, suffix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let suffix = suffix.to_string();
        tokio::task::spawn_blocking(move || list_blocking(&root, &prefix, &suffix))
            .await
            .map_err(|e| StorageError::Listing(format!("listing task failed: {}", e)))?
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ArchiveStore for LocalStore {
    async fn fetch_archive(&self, archive: &ArchiveId, dest_dir: &Path) -> Result<PathBuf, StorageError> {
        let src = self.resolve(archive.as_str())?;
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(StorageError::NotFound(archive.to_string()));
        }
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(archive.file_name());
        tokio::fs::copy(&src, &dest).await?;
        Ok(dest)
    }
}

#[async_trait]
impl DerivativeSink for LocalStore {
    async fn upload(&self, base: &Path, files: &[PathBuf], prefix: &str) -> Result<usize, StorageError> {
        let dest_root = self.resolve(prefix)?;
        let mut uploaded = 0;
        for file in files {
            let dest = dest_root.join(file);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(base.join(file), &dest).await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }
}
