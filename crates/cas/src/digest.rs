//! Content addressing: SHA-256 digests and action keys

use crate::error::{Error, Result};
use crate::proto;
use prost::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// SHA-256 of the empty byte string
pub const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const HASH_LEN: usize = 64;
const READ_CHUNK: usize = 64 * 1024;

/// A Content Addressable Storage (CAS) digest, consisting of a SHA256 hash and size in bytes.
///
/// Equality and hashing cover both fields, as Remote Execution API digests
/// do. Two digests with the same hash but different sizes are different
/// keys; downloads verify the size separately.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex SHA-256 of the content
    pub hash: String,
    /// Content length in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Creates a Digest from a hash string and size, validating both.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();
        if hash.len() != HASH_LEN
            || !hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(Error::invalid_digest(format!(
                "expected {HASH_LEN} lowercase hex characters, got {hash:?}"
            )));
        }
        if size_bytes < 0 {
            return Err(Error::invalid_digest(format!(
                "negative size {size_bytes} for {hash}"
            )));
        }
        Ok(Self { hash, size_bytes })
    }

    /// Creates a Digest from the given content.
    #[must_use]
    pub fn from_bytes(content: &[u8]) -> Self {
        let hash = hex::encode(Sha256::digest(content));
        Self {
            hash,
            size_bytes: content.len() as i64,
        }
    }

    /// Digest of a protobuf message's encoding
    #[must_use]
    pub fn of_message(message: &impl Message) -> Self {
        Self::from_bytes(&message.encode_to_vec())
    }

    /// The digest of the empty blob
    #[must_use]
    pub fn empty() -> Self {
        Self {
            hash: EMPTY_HASH.to_string(),
            size_bytes: 0,
        }
    }

    /// Size 0 denotes the empty blob, which is never transferred
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// Size in bytes as an unsigned count
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.size_bytes).unwrap_or(0)
    }

    /// Size in KiB, rounded up
    #[must_use]
    pub fn size_kb(&self) -> u64 {
        self.size().div_ceil(1024)
    }
}

/// Compute the digest of a byte slice
#[must_use]
pub fn compute_digest(content: &[u8]) -> Digest {
    Digest::from_bytes(content)
}

/// Running SHA-256 and length over content fed in chunks
#[derive(Default)]
struct DigestHasher {
    hasher: Sha256,
    total: u64,
}

impl DigestHasher {
    fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.total += chunk.len() as u64;
    }

    fn finish(self) -> Digest {
        Digest {
            hash: hex::encode(self.hasher.finalize()),
            size_bytes: i64::try_from(self.total).unwrap_or(i64::MAX),
        }
    }
}

/// Hash a reader in fixed-size chunks without holding the whole stream in memory
pub async fn compute_digest_of_reader<R>(reader: &mut R) -> std::io::Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = DigestHasher::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Blocking counterpart of [`compute_digest_of_reader`] for synchronous tree scans
pub(crate) fn compute_digest_of_blocking_reader<R>(reader: &mut R) -> std::io::Result<Digest>
where
    R: std::io::Read + ?Sized,
{
    let mut hasher = DigestHasher::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hash, size) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_digest(format!("expected hash/size, got {s:?}")))?;
        let size_bytes = size
            .parse::<i64>()
            .map_err(|e| Error::invalid_digest(format!("bad size in {s:?}: {e}")))?;
        Self::new(hash, size_bytes)
    }
}

impl From<&Digest> for proto::Digest {
    fn from(digest: &Digest) -> Self {
        Self {
            hash: digest.hash.clone(),
            size_bytes: digest.size_bytes,
        }
    }
}

impl TryFrom<&proto::Digest> for Digest {
    type Error = Error;

    fn try_from(digest: &proto::Digest) -> Result<Self> {
        Self::new(digest.hash.clone(), digest.size_bytes)
    }
}

/// Convert a required proto digest field, reporting which field was absent
pub(crate) fn require_digest(digest: Option<&proto::Digest>, field: &str) -> Result<Digest> {
    digest
        .ok_or_else(|| Error::invalid_digest(format!("missing {field}")))
        .and_then(Digest::try_from)
}

/// Identifies a cached action outcome
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ActionKey(Digest);

impl ActionKey {
    /// Wrap a digest computed by the caller
    #[must_use]
    pub fn new(digest: Digest) -> Self {
        Self(digest)
    }

    /// Key an action by its command and input root
    ///
    /// The Action message references both digests, so the same command over
    /// the same inputs always yields the same key.
    #[must_use]
    pub fn for_action(command: &proto::Command, input_root: &Digest) -> Self {
        let action = proto::Action {
            command_digest: Some((&Digest::of_message(command)).into()),
            input_root_digest: Some(input_root.into()),
        };
        Self(Digest::of_message(&action))
    }

    /// The digest the cached result is stored under
    #[must_use]
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
