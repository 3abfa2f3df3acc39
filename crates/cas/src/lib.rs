//! Remote action cache over a content-addressed blob store
//!
//! This crate provides the cache layer between a build executor and a blob
//! store speaking in Remote Execution API messages:
//! - Content-addressed blob upload and download
//! - A memory governor bounding in-flight upload bytes
//! - Merkle-tree input upload and directory materialization
//! - Action result caching with inline or digest-backed stdout/stderr
//!
//! # Overview
//!
//! Before running an action the executor builds its input tree with
//! [`TreeBuilder`], derives an [`ActionKey`] and asks
//! [`ActionCache::get_cached_action_result`] for a hit. On a hit,
//! [`ActionCache::download`] writes the outputs into the execution root; if
//! that fails partway the partial outputs are removed so local execution can
//! start clean. On a miss the action runs locally and
//! [`ActionCache::upload`] records its outputs for next time.
//!
//! # Stores
//!
//! Any [`BlobStore`] implementation can back the cache. [`InMemoryBlobStore`]
//! and [`DiskBlobStore`] are provided.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error conditions are described by the Error variants"
)]

pub mod action_cache;
pub mod config;
pub mod digest;
mod error;
mod fsutil;
pub mod governor;
pub mod input;
pub mod merkle;
pub mod outerr;
pub mod proto;
pub mod store;
pub mod transfer;
mod tree;

pub use action_cache::ActionCache;
pub use config::CacheConfig;
pub use digest::{ActionKey, Digest, EMPTY_HASH, compute_digest, compute_digest_of_reader};
pub use error::{Direction, Error, Result};
pub use governor::{MemoryGovernor, MemoryPermit};
pub use input::ActionInput;
pub use merkle::{MerkleTree, TreeBuilder, TreeLeaf};
pub use outerr::OutErr;
pub use store::{BlobStore, DiskBlobStore, DynBlobStore, InMemoryBlobStore, StoreStats};
pub use transfer::BlobTransfer;
