//! File helpers: atomic replacement, durable append, content digests

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Replace `path` with `bytes` so readers observe either the old or the new
/// content, never a torn write.
///
/// Writes a sibling temp file, syncs it, renames it over the target and
/// syncs the parent directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".tmp-{}", std::process::id()));
    let tmp = parent.join(tmp_name);

    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    sync_directory(parent);
    Ok(())
}

/// Append `line` plus a newline and sync before returning
pub fn append_line_durable(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    f.write_all(buf.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

/// Hex-encoded SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Remove a directory tree, treating "already gone" as success
pub fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) {
    if let Ok(dir) = File::open(path) {
        if let Err(e) = dir.sync_all() {
            tracing::debug!(dir = %path.display(), error = %e, "Directory sync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger.toml");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_append_line_durable_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.ndjson");

        append_line_durable(&path, "{\"a\":1}").unwrap();
        append_line_durable(&path, "{\"a\":2}").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_remove_dir_all_if_exists_missing_ok() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(remove_dir_all_if_exists(&missing).is_ok());
    }
}
