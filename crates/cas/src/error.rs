//! Error types for the action cache

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Direction of a blob transfer, used when reporting size-limit violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Moving bytes into the blob store
    Upload,
    /// Moving bytes out of the blob store
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("Upload"),
            Self::Download => f.write_str("Download"),
        }
    }
}

/// Error type for blob transfer and action cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Filesystem I/O failed
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(remcache::cas::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// The blob store reported a transport or storage failure
    #[error("Blob store {operation} failed: {message}")]
    #[diagnostic(code(remcache::cas::store))]
    Store {
        /// Store operation that failed
        operation: String,
        /// Description of the failure
        message: String,
    },

    /// A digest-keyed blob is absent from the store
    #[error("Blob not found in cache: {digest}")]
    #[diagnostic(
        code(remcache::cas::not_found),
        help("The blob may have been evicted or never uploaded")
    )]
    NotFound {
        /// The missing digest (`hash/size`)
        digest: String,
    },

    /// A blob is larger than the in-flight memory ceiling
    #[error("{direction}: maximum blob size exceeded: {size_kb}K > {limit_kb}K")]
    #[diagnostic(code(remcache::cas::size_limit))]
    SizeLimitExceeded {
        /// Transfer direction
        direction: Direction,
        /// Blob size in KiB, rounded up
        size_kb: u64,
        /// Configured ceiling in KiB
        limit_kb: u64,
    },

    /// Stored content does not have the size its digest declares
    #[error("Blob {digest} has unexpected size {actual}")]
    #[diagnostic(code(remcache::cas::size_mismatch))]
    SizeMismatch {
        /// The requested digest (`hash/size`)
        digest: String,
        /// Number of bytes actually retrieved
        actual: u64,
    },

    /// A digest string or message is malformed
    #[error("Invalid digest: {0}")]
    #[diagnostic(code(remcache::cas::invalid_digest))]
    InvalidDigest(String),

    /// A stored message could not be decoded
    #[error("Failed to decode {what}")]
    #[diagnostic(code(remcache::cas::decode))]
    Decode {
        /// Kind of message being decoded
        what: &'static str,
        /// Underlying protobuf error
        #[source]
        source: prost::DecodeError,
    },

    /// A Merkle tree could not be assembled from the given entries
    #[error("Invalid input tree: {0}")]
    #[diagnostic(code(remcache::cas::invalid_tree))]
    InvalidTree(String),

    /// The operation needs a feature this cache does not provide
    #[error("{feature} is not supported")]
    #[diagnostic(code(remcache::cas::unsupported))]
    Unsupported {
        /// Description of the unsupported feature
        feature: String,
    },

    /// An output path is not located under the execution root
    #[error("Output {path} is not under execution root {root}")]
    #[diagnostic(code(remcache::cas::outside_exec_root))]
    OutsideExecRoot {
        /// Offending path
        path: PathBuf,
        /// Execution root
        root: PathBuf,
    },

    /// Deleting partially downloaded outputs failed after a download error
    #[error("Failed to delete output files after incomplete download: {}", path.display())]
    #[diagnostic(
        code(remcache::cas::cleanup_failed),
        help("Cannot continue with local execution; remove the listed outputs by hand")
    )]
    CleanupFailed {
        /// The deletion failure
        #[source]
        source: std::io::Error,
        /// Path that could not be deleted
        path: PathBuf,
        /// The download error that triggered the cleanup
        cause: Box<Error>,
    },

    /// A blocking wait was interrupted
    #[error("{operation} was cancelled")]
    #[diagnostic(code(remcache::cas::cancelled))]
    Cancelled {
        /// Operation that was waiting
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(remcache::cas::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create a blob store failure
    #[must_use]
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(digest: impl fmt::Display) -> Self {
        Self::NotFound {
            digest: digest.to_string(),
        }
    }

    /// Create an invalid digest error
    #[must_use]
    pub fn invalid_digest(msg: impl Into<String>) -> Self {
        Self::InvalidDigest(msg.into())
    }

    /// Create an invalid tree error
    #[must_use]
    pub fn invalid_tree(msg: impl Into<String>) -> Self {
        Self::InvalidTree(msg.into())
    }

    /// Create a decode error
    #[must_use]
    pub fn decode(what: &'static str, source: prost::DecodeError) -> Self {
        Self::Decode { what, source }
    }

    /// Create an unsupported feature error
    #[must_use]
    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// True when the error means "blob absent"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the error is an interrupted wait
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether a caller may reasonably retry the failed operation
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Store { .. } => true,
            Self::NotFound { .. }
            | Self::SizeLimitExceeded { .. }
            | Self::SizeMismatch { .. }
            | Self::InvalidDigest(_)
            | Self::InvalidTree(_)
            | Self::Decode { .. }
            | Self::Unsupported { .. }
            | Self::OutsideExecRoot { .. }
            | Self::CleanupFailed { .. }
            | Self::Cancelled { .. }
            | Self::Configuration { .. } => false,
        }
    }

    /// I/O-class failures that leave partially written outputs behind
    #[must_use]
    pub fn triggers_cleanup(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Store { .. }
                | Self::NotFound { .. }
                | Self::SizeMismatch { .. }
                | Self::Decode { .. }
        )
    }

    /// The original download failure carried by a [`Error::CleanupFailed`]
    #[must_use]
    pub fn download_error(&self) -> Option<&Self> {
        match self {
            Self::CleanupFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
