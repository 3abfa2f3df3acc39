//! Action results cached in a blob store
//!
//! Results are stored as encoded `ActionResult` messages under the action
//! key's hash. Output file contents and large captured streams live in the
//! same store as content-addressed blobs; small streams are stored inline.

use crate::config::CacheConfig;
use crate::digest::{ActionKey, Digest};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::governor::MemoryGovernor;
use crate::merkle::MerkleTree;
use crate::outerr::OutErr;
use crate::proto::{self, ActionResult, Command, OutputFile};
use crate::store::DynBlobStore;
use crate::transfer::BlobTransfer;
use prost::Message;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Remote action cache over a [`crate::BlobStore`]
pub struct ActionCache {
    blobs: BlobTransfer,
    config: CacheConfig,
}

/// A declared output that still exists after the action ran
struct PresentOutput {
    absolute: PathBuf,
    relative: String,
    is_executable: bool,
}

impl ActionCache {
    /// Create a cache that is never cancelled externally
    pub fn new(store: DynBlobStore, config: CacheConfig) -> Result<Self> {
        Self::with_cancellation(store, config, CancellationToken::new())
    }

    /// Create a cache whose blocking waits are interrupted by `cancel`
    pub fn with_cancellation(
        store: DynBlobStore,
        config: CacheConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            blobs: BlobTransfer::new(store, config.max_upload_memory_kb, cancel),
            config,
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Blob-level transfer operations
    #[must_use]
    pub fn blobs(&self) -> &BlobTransfer {
        &self.blobs
    }

    /// The upload memory governor
    #[must_use]
    pub fn governor(&self) -> &MemoryGovernor {
        self.blobs.governor()
    }

    /// Token that interrupts blocking waits
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        self.blobs.cancellation_token()
    }

    /// Make the command and input tree of an action available in the store
    pub async fn ensure_inputs_present(
        &self,
        exec_root: &Path,
        tree: &MerkleTree,
        command: &Command,
    ) -> Result<()> {
        self.blobs
            .ensure_inputs_present(exec_root, tree, command)
            .await
    }

    /// Materialize the tree rooted at `root_digest` under `dest`
    pub async fn download_tree(&self, root_digest: &Digest, dest: &Path) -> Result<()> {
        self.blobs.download_tree(root_digest, dest).await
    }

    /// Look up the cached result for `key`
    ///
    /// A missing entry and an entry that does not decode are both a miss.
    /// Store failures and cancellation still propagate.
    #[instrument(skip(self, key), fields(action = %key))]
    pub async fn get_cached_action_result(&self, key: &ActionKey) -> Result<Option<ActionResult>> {
        let Some(bytes) = self.blobs.fetch_key(&key.digest().hash).await? else {
            debug!("Action cache miss");
            return Ok(None);
        };
        match proto::decode::<ActionResult>("ActionResult", &bytes) {
            Ok(result) => {
                debug!(outputs = result.output_files.len(), "Action cache hit");
                Ok(Some(result))
            }
            Err(e) => {
                warn!(error = %e, "Ignoring malformed cached action result");
                Ok(None)
            }
        }
    }

    /// Store `result` under `key`, replacing any earlier entry
    #[instrument(skip(self, key, result), fields(action = %key))]
    pub async fn set_cached_action_result(&self, key: &ActionKey, result: &ActionResult) -> Result<()> {
        self.blobs
            .put_key(&key.digest().hash, &result.encode_to_vec())
            .await?;
        debug!("Stored action result");
        Ok(())
    }

    /// Record the outputs of a finished action and cache the result
    ///
    /// Relative `output_files` are resolved against `exec_root`. Declared
    /// outputs that no longer exist are skipped; a declared output that is a
    /// directory fails the whole upload before anything is sent.
    #[instrument(skip_all, fields(action = %key, exec_root = %exec_root.display()))]
    pub async fn upload(
        &self,
        key: &ActionKey,
        exec_root: &Path,
        output_files: &[PathBuf],
        out_err: &OutErr,
    ) -> Result<ActionResult> {
        let mut result = ActionResult::default();
        self.upload_outputs(&mut result, exec_root, output_files)
            .await?;
        self.upload_out_err_files(&mut result, out_err).await?;
        self.set_cached_action_result(key, &result).await?;
        Ok(result)
    }

    /// Upload output file contents and record them in `result`
    pub async fn upload_outputs(
        &self,
        result: &mut ActionResult,
        exec_root: &Path,
        output_files: &[PathBuf],
    ) -> Result<()> {
        let mut present = Vec::with_capacity(output_files.len());
        for file in output_files {
            if let Some(output) = stat_output(exec_root, file).await? {
                present.push(output);
            }
        }

        for output in present {
            if let Some(file) = self.upload_output(output).await? {
                result.output_files.push(file);
            }
        }
        debug!(outputs = result.output_files.len(), "Uploaded outputs");
        Ok(())
    }

    /// Upload one output; `None` when it vanished after being stat'ed
    async fn upload_output(&self, output: PresentOutput) -> Result<Option<OutputFile>> {
        let digest = match self.blobs.upload_file(&output.absolute).await {
            Ok(digest) => digest,
            Err(Error::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                debug!(path = %output.absolute.display(), "Output removed before upload, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some(OutputFile {
            path: output.relative,
            digest: Some((&digest).into()),
            is_executable: output.is_executable,
            contents: Vec::new(),
        }))
    }

    /// Record captured stdout and stderr in `result`
    ///
    /// Streams up to `max_inline_bytes` are stored inline, longer ones as
    /// blobs. An empty stream is recorded as neither.
    pub async fn upload_out_err(
        &self,
        result: &mut ActionResult,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()> {
        (result.stdout_raw, result.stdout_digest) = self.encode_stream(stdout).await?;
        (result.stderr_raw, result.stderr_digest) = self.encode_stream(stderr).await?;
        Ok(())
    }

    async fn encode_stream(&self, bytes: &[u8]) -> Result<(Vec<u8>, Option<proto::Digest>)> {
        if bytes.is_empty() {
            return Ok((Vec::new(), None));
        }
        if bytes.len() <= self.config.max_inline_bytes {
            return Ok((bytes.to_vec(), None));
        }
        let digest = self.blobs.upload_blob(bytes).await?;
        Ok((Vec::new(), Some((&digest).into())))
    }

    async fn upload_out_err_files(&self, result: &mut ActionResult, out_err: &OutErr) -> Result<()> {
        (result.stdout_raw, result.stdout_digest) =
            self.encode_stream_file(&out_err.stdout_path).await?;
        (result.stderr_raw, result.stderr_digest) =
            self.encode_stream_file(&out_err.stderr_path).await?;
        Ok(())
    }

    /// Same policy as [`Self::encode_stream`], without reading large files into memory
    async fn encode_stream_file(&self, path: &Path) -> Result<(Vec<u8>, Option<proto::Digest>)> {
        let len = match fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(Error::io(e, path, "stat")),
        };
        if len == 0 {
            return Ok((Vec::new(), None));
        }
        if len <= self.config.max_inline_bytes as u64 {
            let bytes = fs::read(path)
                .await
                .map_err(|e| Error::io(e, path, "read"))?;
            return Ok((bytes, None));
        }
        let digest = self.blobs.upload_file(path).await?;
        Ok((Vec::new(), Some((&digest).into())))
    }

    /// Write the outputs and captured streams of a cached result to disk
    ///
    /// Every output path and digest is validated before anything is written.
    /// If writing fails partway, every declared output and both stream files
    /// are deleted before the error is returned. When that deletion fails too,
    /// [`Error::CleanupFailed`] is returned carrying the original error.
    #[instrument(skip_all, fields(exec_root = %exec_root.display(), outputs = result.output_files.len()))]
    pub async fn download(&self, result: &ActionResult, exec_root: &Path, out_err: &OutErr) -> Result<()> {
        if !result.output_directories.is_empty() {
            return Err(Error::unsupported("Downloading output directories"));
        }
        let outputs = result
            .output_files
            .iter()
            .map(|file| {
                Ok(PlannedWrite {
                    dest: resolve_output(exec_root, &file.path)?,
                    content: output_content(file)?,
                    is_executable: file.is_executable,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let streams = [
            (&result.stdout_raw, result.stdout_digest.as_ref(), &out_err.stdout_path),
            (&result.stderr_raw, result.stderr_digest.as_ref(), &out_err.stderr_path),
        ]
        .into_iter()
        .filter_map(|(raw, digest, path)| {
            stream_content(raw, digest)
                .map(|content| {
                    content.map(|content| PlannedWrite {
                        dest: path.clone(),
                        content,
                        is_executable: false,
                    })
                })
                .transpose()
        })
        .collect::<Result<Vec<_>>>()?;

        let written = self.materialize(outputs.iter().chain(&streams)).await;
        match written {
            Ok(()) => {
                debug!("Downloaded action outputs");
                Ok(())
            }
            Err(e) if e.triggers_cleanup() => {
                warn!(error = %e, "Download failed, removing partial outputs");
                let destinations: Vec<_> = outputs.into_iter().map(|write| write.dest).collect();
                remove_outputs(&destinations, out_err, e).await
            }
            Err(e) => Err(e),
        }
    }

    async fn materialize<'w, 'a: 'w>(&self, writes: impl Iterator<Item = &'w PlannedWrite<'a>>) -> Result<()> {
        for write in writes {
            self.blobs.check_cancelled("output download")?;
            match &write.content {
                Content::Inline(bytes) => {
                    self.blobs
                        .write_file(bytes, &write.dest, write.is_executable)
                        .await?;
                }
                Content::Blob(digest) => {
                    self.blobs
                        .download_file(digest, &write.dest, write.is_executable)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Close the underlying store and fail pending budget waits
    pub async fn close(&self) -> Result<()> {
        self.blobs.close().await
    }
}

/// Where one downloaded file comes from
enum Content<'a> {
    Inline(&'a [u8]),
    Blob(Digest),
}

/// A validated file write, planned before anything touches the disk
struct PlannedWrite<'a> {
    dest: PathBuf,
    content: Content<'a>,
    is_executable: bool,
}

/// Inline contents win; otherwise the digest; with neither the file is empty
fn output_content(file: &OutputFile) -> Result<Content<'_>> {
    if !file.contents.is_empty() {
        return Ok(Content::Inline(&file.contents));
    }
    match &file.digest {
        Some(digest) => Ok(Content::Blob(Digest::try_from(digest)?)),
        None => Ok(Content::Inline(&[])),
    }
}

/// A captured stream with neither inline bytes nor a digest is not written
fn stream_content<'a>(raw: &'a [u8], digest: Option<&proto::Digest>) -> Result<Option<Content<'a>>> {
    if !raw.is_empty() {
        return Ok(Some(Content::Inline(raw)));
    }
    digest
        .map(|digest| Ok(Content::Blob(Digest::try_from(digest)?)))
        .transpose()
}

/// Resolve a declared output and check it can be uploaded
async fn stat_output(exec_root: &Path, file: &Path) -> Result<Option<PresentOutput>> {
    let absolute = exec_root.join(file);
    let metadata = match fs::metadata(&absolute).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %absolute.display(), "Declared output missing, skipping");
            return Ok(None);
        }
        Err(e) => return Err(Error::io(e, &absolute, "stat")),
    };
    if metadata.is_dir() {
        return Err(Error::unsupported(format!(
            "Uploading output directory {}",
            absolute.display()
        )));
    }

    let relative = absolute
        .strip_prefix(exec_root)
        .ok()
        .and_then(relative_output_path)
        .ok_or_else(|| Error::OutsideExecRoot {
            path: absolute.clone(),
            root: exec_root.to_path_buf(),
        })?;

    Ok(Some(PresentOutput {
        is_executable: fsutil::is_executable(&metadata),
        absolute,
        relative,
    }))
}

/// `/`-separated form of a path made only of normal components
fn relative_output_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Where a recorded output path lands under `exec_root`
fn resolve_output(exec_root: &Path, recorded: &str) -> Result<PathBuf> {
    let path = Path::new(recorded);
    if relative_output_path(path).is_none() {
        return Err(Error::OutsideExecRoot {
            path: path.to_path_buf(),
            root: exec_root.to_path_buf(),
        });
    }
    Ok(exec_root.join(path))
}

/// Delete everything a failed download may have written, then surface `cause`
async fn remove_outputs(destinations: &[PathBuf], out_err: &OutErr, cause: Error) -> Result<()> {
    let stream_paths = [&out_err.stdout_path, &out_err.stderr_path];
    for path in destinations.iter().chain(stream_paths) {
        if let Err(source) = fsutil::remove_file_if_exists(path).await {
            error!(path = %path.display(), error = %source, "Failed to remove partial output");
            return Err(Error::CleanupFailed {
                source,
                path: path.clone(),
                cause: Box::new(cause),
            });
        }
    }
    Err(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBlobStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cache(store: &Arc<InMemoryBlobStore>, max_inline_bytes: usize) -> ActionCache {
        let config = CacheConfig {
            max_inline_bytes,
            ..CacheConfig::default()
        };
        ActionCache::new(store.clone(), config).unwrap()
    }

    fn key(name: &str) -> ActionKey {
        ActionKey::new(Digest::from_bytes(name.as_bytes()))
    }

    #[tokio::test]
    async fn test_inline_threshold() {
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let mut result = ActionResult::default();

        cache
            .upload_out_err(&mut result, &[b'o'; 16], &[b'e'; 17])
            .await
            .unwrap();

        assert_eq!(result.stdout_raw, vec![b'o'; 16]);
        assert!(result.stdout_digest.is_none());
        assert!(result.stderr_raw.is_empty());
        let stderr_digest = Digest::try_from(result.stderr_digest.as_ref().unwrap()).unwrap();
        assert_eq!(stderr_digest, Digest::from_bytes(&[b'e'; 17]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_streams_recorded_as_neither() {
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let mut result = ActionResult::default();

        cache.upload_out_err(&mut result, b"", b"").await.unwrap();

        assert!(result.stdout_raw.is_empty() && result.stdout_digest.is_none());
        assert!(result.stderr_raw.is_empty() && result.stderr_digest.is_none());
        assert_eq!(store.stats().puts, 0);
    }

    #[tokio::test]
    async fn test_absent_and_corrupt_entries_are_misses() {
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);

        assert!(cache.get_cached_action_result(&key("never")).await.unwrap().is_none());

        let corrupt = key("corrupt");
        store
            .insert_raw(corrupt.digest().hash.clone(), vec![0xff; 4])
            .await;
        assert!(cache.get_cached_action_result(&corrupt).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let action = key("action");

        for exit_code in [1, 2] {
            let result = ActionResult {
                exit_code,
                ..Default::default()
            };
            cache.set_cached_action_result(&action, &result).await.unwrap();
        }

        let cached = cache.get_cached_action_result(&action).await.unwrap().unwrap();
        assert_eq!(cached.exit_code, 2);
    }

    #[tokio::test]
    async fn test_closed_store_is_not_a_miss() {
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        cache.close().await.unwrap();

        assert!(cache.get_cached_action_result(&key("any")).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_outputs_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("present.txt"), b"here").unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);

        let result = cache
            .upload(
                &key("action"),
                tmp.path(),
                &[PathBuf::from("present.txt"), PathBuf::from("gone.txt")],
                &OutErr::in_dir(&tmp.path().join("logs")),
            )
            .await
            .unwrap();

        assert_eq!(result.output_files.len(), 1);
        assert_eq!(result.output_files[0].path, "present.txt");
    }

    #[tokio::test]
    async fn test_output_removed_before_upload_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let vanished = PresentOutput {
            absolute: tmp.path().join("vanished.txt"),
            relative: "vanished.txt".to_string(),
            is_executable: false,
        };

        assert!(cache.upload_output(vanished).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_download_validates_digests_before_writing() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let out_err = OutErr::in_dir(tmp.path());
        let result = ActionResult {
            output_files: vec![OutputFile {
                path: "written".to_string(),
                contents: b"bytes".to_vec(),
                ..Default::default()
            }],
            stdout_raw: b"out".to_vec(),
            stderr_digest: Some(proto::Digest {
                hash: "zz".to_string(),
                size_bytes: 2,
            }),
            ..Default::default()
        };

        let err = cache.download(&result, tmp.path(), &out_err).await.unwrap_err();

        assert!(matches!(err, Error::InvalidDigest(_)), "unexpected error: {err}");
        assert!(!tmp.path().join("written").exists());
        assert!(!out_err.stdout_path.exists());
    }

    #[tokio::test]
    async fn test_output_directory_rejected_before_upload() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(tmp.path().join("dir")).unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);

        let err = cache
            .upload(
                &key("action"),
                tmp.path(),
                &[PathBuf::from("a.txt"), PathBuf::from("dir")],
                &OutErr::in_dir(tmp.path()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Unsupported { .. }));
        assert_eq!(store.stats().puts, 0);
    }

    #[tokio::test]
    async fn test_download_output_directories_unsupported() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let result = ActionResult {
            output_directories: vec![proto::OutputDirectory {
                path: "out".to_string(),
                tree_digest: None,
            }],
            ..Default::default()
        };

        let err = cache
            .download(&result, tmp.path(), &OutErr::in_dir(tmp.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_download_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(InMemoryBlobStore::new());
        let cache = cache(&store, 16);
        let result = ActionResult {
            output_files: vec![OutputFile {
                path: "../escape".to_string(),
                contents: b"x".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let exec_root = tmp.path().join("root");
        let err = cache
            .download(&result, &exec_root, &OutErr::in_dir(tmp.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutsideExecRoot { .. }));
        assert!(!tmp.path().join("escape").exists());
    }

    #[test]
    fn test_relative_output_path() {
        assert_eq!(
            relative_output_path(Path::new("a/b/c.txt")).as_deref(),
            Some("a/b/c.txt")
        );
        assert!(relative_output_path(Path::new("../c.txt")).is_none());
        assert!(relative_output_path(Path::new("/abs")).is_none());
        assert!(relative_output_path(Path::new("")).is_none());
    }
}
