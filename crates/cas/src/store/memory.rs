//! Map-backed blob store

use super::{BlobReader, BlobStore, BlobWriter};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

/// Counts of store calls, used to verify which paths touch the store
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of `put` calls
    pub puts: usize,
    /// Number of `get` calls
    pub gets: usize,
    /// Number of `contains_key` calls
    pub contains: usize,
}

/// Blob store held entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    gets: AtomicUsize,
    contains: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryBlobStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether the store holds no blobs
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Store bytes under an arbitrary key, bypassing content addressing
    pub async fn insert_raw(&self, key: impl Into<String>, data: Vec<u8>) {
        self.blobs.write().await.insert(key.into(), data);
    }

    /// Remove a blob, returning its bytes
    pub async fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.write().await.remove(key)
    }

    /// Call counts since creation
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            puts: self.puts.load(Ordering::SeqCst),
            gets: self.gets.load(Ordering::SeqCst),
            contains: self.contains.load(Ordering::SeqCst),
        }
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::store(operation, "store is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, data: BlobReader<'_>) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.ensure_open("put")?;

        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .map_err(|e| Error::io_no_path(e, "read blob for put"))?;
        self.blobs.write().await.insert(key.to_string(), buf);
        Ok(())
    }

    async fn get(&self, key: &str, out: BlobWriter<'_>) -> Result<bool> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.ensure_open("get")?;

        // Copy out under the lock, write without it.
        let Some(data) = self.blobs.read().await.get(key).cloned() else {
            return Ok(false);
        };
        out.write_all(&data)
            .await
            .map_err(|e| Error::io_no_path(e, "write blob from get"))?;
        Ok(true)
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        self.contains.fetch_add(1, Ordering::SeqCst);
        self.ensure_open("contains_key")?;
        Ok(self.blobs.read().await.contains_key(key))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let store = InMemoryBlobStore::new();
        let mut data: &[u8] = b"hello";
        store.put("k", &mut data).await.unwrap();

        let mut out = Vec::new();
        assert!(store.get("k", &mut out).await.unwrap());
        assert_eq!(out, b"hello");
        assert!(store.contains_key("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = InMemoryBlobStore::new();
        let mut out = Vec::new();
        assert!(!store.get("missing", &mut out).await.unwrap());
        assert!(out.is_empty());
        assert_eq!(store.stats().gets, 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = InMemoryBlobStore::new();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.contains_key("k").await.is_err());
    }
}
