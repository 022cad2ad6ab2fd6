//! Directory-backed key/value store
//!
//! Each record lives in its own file named `<hex(key)>.json`. Keys such as
//! `session:{id}` contain characters that are not portable in file names, so
//! the name is the hex encoding of the key bytes.
//!
//! Writes are atomic: the value goes to a `.tmp` sibling unique to that
//! write, which is then renamed over the record. Concurrent writers of one
//! key never share a temp file; the last rename wins.

use super::KvStore;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

const RECORD_EXTENSION: &str = "json";

/// File-based key/value store
pub struct FileKvStore {
    base_path: PathBuf,
}

impl FileKvStore {
    /// Create a store rooted at `base_path`, creating the directory if needed
    pub fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", hex::encode(key.as_bytes()), RECORD_EXTENSION))
    }

    /// Write file atomically (write to temp, then rename)
    async fn write_atomic(&self, path: &Path, data: &str) -> StorageResult<()> {
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, data).await?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                warn!(path = %temp_path.display(), error = %cleanup, "Error removing temp file");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.record_path(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!("reading {}: {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.record_path(key);
        self.write_atomic(&path, value).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!("removing {}: {}", key, e))),
        }
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Foreign files in the directory are skipped
            if let Some(key) = hex::decode(stem)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                keys.push(key);
            }
        }

        Ok(keys)
    }
}
