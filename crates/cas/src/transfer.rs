//! Blob upload/download through the memory governor

use crate::digest::{Digest, compute_digest_of_reader};
use crate::error::{Direction, Error, Result};
use crate::fsutil;
use crate::governor::MemoryGovernor;
use crate::store::{BlobReader, BlobWriter, DynBlobStore};
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Moves raw blobs between callers and the blob store
///
/// Uploads hold governor budget sized to the blob for the whole transfer.
/// Every store call races the cancellation token.
pub struct BlobTransfer {
    store: DynBlobStore,
    governor: MemoryGovernor,
    cancel: CancellationToken,
}

impl BlobTransfer {
    /// Create a transfer layer over `store` with an upload ceiling in KiB
    #[must_use]
    pub fn new(store: DynBlobStore, max_upload_memory_kb: u32, cancel: CancellationToken) -> Self {
        Self {
            store,
            governor: MemoryGovernor::new(max_upload_memory_kb),
            cancel,
        }
    }

    /// The upload memory governor
    #[must_use]
    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    /// Token that interrupts blocking waits
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        Ok(())
    }

    async fn interruptible<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::cancelled(format!("blob store {operation}"))),
            result = fut => result,
        }
    }

    /// Hash and upload an in-memory blob
    #[instrument(skip(self, blob), fields(size = blob.len()))]
    pub async fn upload_blob(&self, blob: &[u8]) -> Result<Digest> {
        let digest = Digest::from_bytes(blob);
        let mut reader = blob;
        self.upload_blob_stream(&digest, &mut reader).await
    }

    /// Upload pre-hashed content without re-hashing it
    ///
    /// The caller vouches that `data` matches `digest`.
    #[instrument(skip(self, digest, data), fields(digest = %digest))]
    pub async fn upload_blob_stream(&self, digest: &Digest, data: BlobReader<'_>) -> Result<Digest> {
        let _permit = self.governor.acquire(digest.size(), &self.cancel).await?;
        if digest.is_empty() {
            return Ok(digest.clone());
        }
        self.interruptible("put", self.store.put(&digest.hash, data))
            .await?;
        debug!("Uploaded blob");
        Ok(digest.clone())
    }

    /// Upload a file, hashing it in a streaming pass first
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn upload_file(&self, path: &Path) -> Result<Digest> {
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| Error::io(e, path, "open"))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::io(e, path, "stat"))?
            .len();
        self.governor.check(len, Direction::Upload)?;

        let digest = compute_digest_of_reader(&mut file)
            .await
            .map_err(|e| Error::io(e, path, "read"))?;
        file.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| Error::io(e, path, "seek"))?;
        self.upload_blob_stream(&digest, &mut file).await
    }

    /// Store bytes under a key that is not their content hash
    pub(crate) async fn put_key(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let _permit = self.governor.acquire(bytes.len() as u64, &self.cancel).await?;
        let mut reader = bytes;
        self.interruptible("put", self.store.put(key, &mut reader))
            .await
    }

    /// Fetch whatever is stored under a raw key
    pub(crate) async fn fetch_key(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let found = self
            .interruptible("get", self.store.get(key, &mut buf))
            .await?;
        Ok(found.then_some(buf))
    }

    /// Download a blob into memory
    #[instrument(skip(self, digest), fields(digest = %digest))]
    pub async fn download_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        if digest.is_empty() {
            return Ok(Vec::new());
        }
        self.governor.check(digest.size(), Direction::Download)?;
        let mut buf = Vec::with_capacity(usize::try_from(digest.size()).unwrap_or(0));
        self.download_blob_to(digest, &mut buf).await?;
        Ok(buf)
    }

    /// Stream a blob into `out` without buffering it whole
    pub async fn download_blob_to(&self, digest: &Digest, out: BlobWriter<'_>) -> Result<()> {
        if digest.is_empty() {
            return Ok(());
        }
        let mut counting = CountingWriter {
            inner: out,
            written: 0,
        };
        let found = self
            .interruptible("get", self.store.get(&digest.hash, &mut counting))
            .await?;
        if !found {
            return Err(Error::not_found(digest));
        }
        if counting.written != digest.size() {
            return Err(Error::SizeMismatch {
                digest: digest.to_string(),
                actual: counting.written,
            });
        }
        Ok(())
    }

    /// Whether the blob is present; the empty blob always is
    pub async fn contains_key(&self, digest: &Digest) -> Result<bool> {
        if digest.is_empty() {
            return Ok(true);
        }
        self.interruptible("contains_key", self.store.contains_key(&digest.hash))
            .await
    }

    /// Download a blob to `dest`, creating parents and setting the executable bit
    pub async fn download_file(&self, digest: &Digest, dest: &Path, executable: bool) -> Result<()> {
        fsutil::create_parent_dirs(dest).await?;
        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| Error::io(e, dest, "create"))?;
        self.download_blob_to(digest, &mut file).await?;
        file.flush()
            .await
            .map_err(|e| Error::io(e, dest, "flush"))?;
        drop(file);
        fsutil::set_executable(dest, executable).await
    }

    /// Write in-memory contents to `dest`, creating parents and setting the executable bit
    pub async fn write_file(&self, contents: &[u8], dest: &Path, executable: bool) -> Result<()> {
        fsutil::create_parent_dirs(dest).await?;
        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| Error::io(e, dest, "create"))?;
        file.write_all(contents)
            .await
            .map_err(|e| Error::io(e, dest, "write"))?;
        file.flush()
            .await
            .map_err(|e| Error::io(e, dest, "flush"))?;
        drop(file);
        fsutil::set_executable(dest, executable).await
    }

    /// Close the store and fail pending budget waits
    pub async fn close(&self) -> Result<()> {
        self.governor.close();
        self.store.close().await
    }
}

/// Counts bytes passing through to the wrapped writer
struct CountingWriter<'a> {
    inner: BlobWriter<'a>,
    written: u64,
}

impl AsyncWrite for CountingWriter<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written += *n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryBlobStore, StoreStats};
    use std::sync::Arc;

    fn transfer(store: &Arc<InMemoryBlobStore>, kb: u32) -> BlobTransfer {
        BlobTransfer::new(store.clone(), kb, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);

        let digest = blobs.upload_blob(b"hello world").await.unwrap();
        assert_eq!(digest, Digest::from_bytes(b"hello world"));
        assert_eq!(blobs.download_blob(&digest).await.unwrap(), b"hello world");
        assert_eq!(blobs.governor().in_flight_kb(), 0);
    }

    #[tokio::test]
    async fn test_empty_digest_never_touches_store() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);

        assert!(blobs.download_blob(&Digest::empty()).await.unwrap().is_empty());
        assert!(blobs.contains_key(&Digest::empty()).await.unwrap());
        blobs.upload_blob(b"").await.unwrap();

        assert_eq!(store.stats(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);
        let err = blobs
            .download_blob(&Digest::from_bytes(b"never uploaded"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_size_mismatch_detected() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);
        let digest = Digest::from_bytes(b"expected");
        store.insert_raw(digest.hash.clone(), b"short".to_vec()).await;

        let err = blobs.download_blob(&digest).await.unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { actual: 5, .. }));
    }

    #[tokio::test]
    async fn test_oversized_blob_rejected_both_ways() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1);
        let big = vec![1u8; 1025];

        let err = blobs.upload_blob(&big).await.unwrap_err();
        assert!(matches!(
            err,
            Error::SizeLimitExceeded {
                direction: Direction::Upload,
                ..
            }
        ));

        let err = blobs
            .download_blob(&Digest::from_bytes(&big))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SizeLimitExceeded {
                direction: Direction::Download,
                ..
            }
        ));
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_idempotent_upload() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);

        let d1 = blobs.upload_blob(b"same").await.unwrap();
        let d2 = blobs.upload_blob(b"same").await.unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.len().await, 1);
        assert_eq!(blobs.download_blob(&d1).await.unwrap(), b"same");
    }

    #[tokio::test]
    async fn test_upload_file_streams_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        let content = vec![9u8; 300_000];
        std::fs::write(&path, &content).unwrap();

        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);
        let digest = blobs.upload_file(&path).await.unwrap();

        assert_eq!(digest, Digest::from_bytes(&content));
        assert_eq!(blobs.download_blob(&digest).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_cancelled_store_access() {
        let store = Arc::new(InMemoryBlobStore::new());
        let blobs = transfer(&store, 1024);
        blobs.cancellation_token().cancel();

        let err = blobs.upload_blob(b"data").await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(blobs.governor().in_flight_kb(), 0);
    }
}
