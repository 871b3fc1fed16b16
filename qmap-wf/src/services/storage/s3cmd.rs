//! Object storage through the `s3cmd` command line client
//!
//! Uses the same s3cmd-style credential file operators already keep for
//! their buckets (`access_key`, `secret_key`, `host_base`).

use crate::error::{StorageError, ToolError};
use crate::models::ArchiveId;
use crate::services::collaborators::{ArchiveStore, DerivativeSink, MetadataSource, ObjectInfo};
use crate::services::command;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

/// s3cmd-backed store for one bucket
#[derive(Debug, Clone)]
pub struct S3cmdStore {
    program: String,
    config: Option<PathBuf>,
    bucket: String,
}

impl S3cmdStore {
    pub fn new(program: impl Into<String>, config: Option<PathBuf>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let bucket = bucket
            .trim_start_matches("s3://")
            .trim_end_matches('/')
            .to_string();
        Self {
            program: program.into(),
            config,
            bucket,
        }
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(cfg) = &self.config {
            args.push("-c".to_string());
            args.push(cfg.display().to_string());
        }
        args
    }

    async fn run(&self, extra: Vec<String>) -> Result<Vec<u8>, StorageError> {
        let mut args = self.base_args();
        args.extend(extra);
        command::run_captured(&self.program, &args)
            .await
            .map_err(storage_error)
    }
}

fn storage_error(err: ToolError) -> StorageError {
    match err {
        ToolError::Io(e) => StorageError::Io(e),
        other => StorageError::Command(other.to_string()),
    }
}

/// Parse `s3cmd ls --recursive` output.
///
/// Lines look like `2024-03-07 09:05   1234   s3://bucket/path/key`;
/// directory lines (`DIR`) are skipped.
pub fn parse_listing(bucket: &str, output: &str) -> Result<Vec<ObjectInfo>, StorageError> {
    let url_prefix = format!("s3://{}/", bucket);
    let mut objects = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(url_start) = line.find("s3://") else {
            return Err(StorageError::Listing(line.to_string()));
        };
        let (head, url) = line.split_at(url_start);
        let fields: Vec<&str> = head.split_whitespace().collect();
        if fields.first() == Some(&"DIR") {
            continue;
        }
        if fields.len() < 3 {
            return Err(StorageError::Listing(line.to_string()));
        }
        let stamp = format!("{} {}", fields[0], fields[1]);
        let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M")
            .map_err(|e| StorageError::Listing(format!("{}: {}", line, e)))?;
        let key = url.strip_prefix(&url_prefix).unwrap_or(url).to_string();
        objects.push(ObjectInfo {
            key,
            last_modified: DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc),
        });
    }
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[async_trait]
impl MetadataSource for S3cmdStore {
    async fn list(&self, prefix: &str, suffix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let out = self
            .run(vec!["ls".to_string(), "--recursive".to_string(), self.url(prefix)])
            .await?;
        let listing = parse_listing(&self.bucket, &String::from_utf8_lossy(&out))?;
        Ok(listing
            .into_iter()
            .filter(|o| o.key.starts_with(prefix) && o.key.ends_with(suffix))
            .collect())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        // "-" streams the object to stdout
        self.run(vec!["get".to_string(), self.url(key), "-".to_string()])
            .await
    }
}

#[async_trait]
impl ArchiveStore for S3cmdStore {
    async fn fetch_archive(&self, archive: &ArchiveId, dest_dir: &Path) -> Result<PathBuf, StorageError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(archive.file_name());
        self.run(vec![
            "get".to_string(),
            "--force".to_string(),
            self.url(archive.as_str()),
            dest.display().to_string(),
        ])
        .await?;
        if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Err(StorageError::NotFound(archive.to_string()));
        }
        Ok(dest)
    }
}

#[async_trait]
impl DerivativeSink for S3cmdStore {
    async fn upload(&self, base: &Path, files: &[PathBuf], prefix: &str) -> Result<usize, StorageError> {
        let prefix = prefix.trim_matches('/');
        let mut uploaded = 0;
        for file in files {
            let rel = file
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let key = if prefix.is_empty() {
                rel
            } else {
                format!("{}/{}", prefix, rel)
            };
            self.run(vec![
                "put".to_string(),
                base.join(file).display().to_string(),
                self.url(&key),
            ])
            .await?;
            tracing::debug!(key = %key, "Uploaded derivative");
            uploaded += 1;
        }
        Ok(uploaded)
    }
}
