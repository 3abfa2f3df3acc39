//! Key/value blob storage the cache is layered on
//!
//! The cache only needs four operations from a store. Keys are content hashes
//! or action key hashes, and a `put` replaces whatever was stored under its key.

mod disk;
mod memory;

pub use disk::DiskBlobStore;
pub use memory::{InMemoryBlobStore, StoreStats};

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Readable byte source handed to [`BlobStore::put`]
pub type BlobReader<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// Writable byte sink handed to [`BlobStore::get`]
pub type BlobWriter<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

/// Abstract content-addressed key/value store
///
/// Implementations provide their own internal synchronization; the cache
/// issues no locking around these calls.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store everything read from `data` under `key`
    async fn put(&self, key: &str, data: BlobReader<'_>) -> Result<()>;

    /// Write the blob stored under `key` to `out`; `false` if absent
    async fn get(&self, key: &str, out: BlobWriter<'_>) -> Result<bool>;

    /// Whether `key` is present
    async fn contains_key(&self, key: &str) -> Result<bool>;

    /// Release transport resources; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Shared handle to a blob store
pub type DynBlobStore = Arc<dyn BlobStore>;
