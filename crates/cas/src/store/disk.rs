//! Filesystem-backed blob store

use super::{BlobReader, BlobStore, BlobWriter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

/// Blob store laid out as `root/ab/cd/<key>` on a local filesystem
///
/// Writes land in a temporary file beside their final location and are
/// renamed into place, so a reader never observes a truncated blob and a
/// second put for a key replaces the first.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::io(e, &root, "create_dir_all"))?;
        Ok(Self { root })
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::store("resolve", format!("invalid blob key {key:?}")));
        }
        if key.len() < 4 {
            return Ok(self.root.join(key));
        }
        Ok(self.root.join(&key[0..2]).join(&key[2..4]).join(key))
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    #[instrument(skip(self, data), fields(root = %self.root.display()))]
    async fn put(&self, key: &str, data: BlobReader<'_>) -> Result<()> {
        let path = self.blob_path(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::io(e, &parent, "create_dir_all"))?;

        // Removed on drop unless persisted, so a failed or cancelled put leaves nothing behind.
        let temp_path = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| Error::io(e, &parent, "create temp file"))?
            .into_temp_path();

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::io(e, &temp_path, "create"))?;
        tokio::io::copy(data, &mut file)
            .await
            .map_err(|e| Error::io(e, &temp_path, "write"))?;
        file.flush()
            .await
            .map_err(|e| Error::io(e, &temp_path, "flush"))?;
        drop(file);

        temp_path
            .persist(&path)
            .map_err(|e| Error::io(e.error, &path, "persist"))?;
        debug!(key, "Stored blob");
        Ok(())
    }

    async fn get(&self, key: &str, out: BlobWriter<'_>) -> Result<bool> {
        let path = self.blob_path(key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(e, &path, "open")),
        };
        tokio::io::copy(&mut file, out)
            .await
            .map_err(|e| Error::io(e, &path, "read"))?;
        Ok(true)
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        let path = self.blob_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| Error::io(e, &path, "stat"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sharded_layout() {
        let tmp = TempDir::new().unwrap();
        let store = DiskBlobStore::open(tmp.path().join("cas")).await.unwrap();

        let mut data: &[u8] = b"contents";
        store.put("abcdef", &mut data).await.unwrap();

        assert!(tmp.path().join("cas/ab/cd/abcdef").exists());
        let mut out = Vec::new();
        assert!(store.get("abcdef", &mut out).await.unwrap());
        assert_eq!(out, b"contents");
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let store = DiskBlobStore::open(tmp.path()).await.unwrap();

        let mut first: &[u8] = b"one";
        store.put("abcd1234", &mut first).await.unwrap();
        let mut second: &[u8] = b"two";
        store.put("abcd1234", &mut second).await.unwrap();

        let mut out = Vec::new();
        store.get("abcd1234", &mut out).await.unwrap();
        assert_eq!(out, b"two");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys() {
        let tmp = TempDir::new().unwrap();
        let store = DiskBlobStore::open(tmp.path()).await.unwrap();

        let mut out = Vec::new();
        assert!(!store.get("abcd0000", &mut out).await.unwrap());
        assert!(!store.contains_key("abcd0000").await.unwrap());
        assert!(store.contains_key("../escape").await.is_err());
    }
}
