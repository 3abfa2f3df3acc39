//! Wire messages stored in the blob store
//!
//! Field numbers follow the Bazel Remote Execution API v2 so blobs written
//! here decode with any REAPI-aware tool. Only the fields this cache reads or
//! writes are declared; unknown fields in stored blobs are skipped on decode.

use crate::error::{Error, Result};
use prost::Message;

/// Content address of a blob
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Digest {
    /// Lowercase hex SHA-256
    #[prost(string, tag = "1")]
    pub hash: String,
    /// Length in bytes
    #[prost(int64, tag = "2")]
    pub size_bytes: i64,
}

/// A file entry inside a [`Directory`]
#[derive(Clone, PartialEq, prost::Message)]
pub struct FileNode {
    /// Entry name, a single path component
    #[prost(string, tag = "1")]
    pub name: String,
    /// Digest of the file contents
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    /// Whether the executable bit is set
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
}

/// A subdirectory entry inside a [`Directory`]
#[derive(Clone, PartialEq, prost::Message)]
pub struct DirectoryNode {
    /// Entry name, a single path component
    #[prost(string, tag = "1")]
    pub name: String,
    /// Digest of the serialized child [`Directory`]
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
}

/// One level of a Merkle tree
#[derive(Clone, PartialEq, prost::Message)]
pub struct Directory {
    /// Files, sorted by name
    #[prost(message, repeated, tag = "1")]
    pub files: Vec<FileNode>,
    /// Subdirectories, sorted by name
    #[prost(message, repeated, tag = "2")]
    pub directories: Vec<DirectoryNode>,
}

/// A `NAME=value` pair in a [`Command`]
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvironmentVariable {
    /// Variable name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Variable value
    #[prost(string, tag = "2")]
    pub value: String,
}

/// The argv and environment of an action
#[derive(Clone, PartialEq, prost::Message)]
pub struct Command {
    /// Program followed by its arguments
    #[prost(string, repeated, tag = "1")]
    pub arguments: Vec<String>,
    /// Environment, sorted by name
    #[prost(message, repeated, tag = "2")]
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Declared output files, relative to the working directory
    #[prost(string, repeated, tag = "3")]
    pub output_files: Vec<String>,
    /// Declared output directories, relative to the working directory
    #[prost(string, repeated, tag = "4")]
    pub output_directories: Vec<String>,
    /// Working directory relative to the input root
    #[prost(string, tag = "6")]
    pub working_directory: String,
}

/// Pairs a command with its input tree; its digest is the action key
#[derive(Clone, PartialEq, prost::Message)]
pub struct Action {
    /// Digest of the serialized [`Command`]
    #[prost(message, optional, tag = "1")]
    pub command_digest: Option<Digest>,
    /// Digest of the root [`Directory`] of the inputs
    #[prost(message, optional, tag = "2")]
    pub input_root_digest: Option<Digest>,
}

/// A file produced by an action
///
/// Exactly one of `digest` and `contents` carries the data.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OutputFile {
    /// Path relative to the execution root
    #[prost(string, tag = "1")]
    pub path: String,
    /// Digest of the contents when stored out of line
    #[prost(message, optional, tag = "2")]
    pub digest: Option<Digest>,
    /// Whether the executable bit is set
    #[prost(bool, tag = "4")]
    pub is_executable: bool,
    /// Inline contents
    #[prost(bytes = "vec", tag = "5")]
    pub contents: Vec<u8>,
}

/// A directory produced by an action
#[derive(Clone, PartialEq, prost::Message)]
pub struct OutputDirectory {
    /// Path relative to the execution root
    #[prost(string, tag = "1")]
    pub path: String,
    /// Digest of the serialized tree
    #[prost(message, optional, tag = "3")]
    pub tree_digest: Option<Digest>,
}

/// The cached outcome of running an action
#[derive(Clone, PartialEq, prost::Message)]
pub struct ActionResult {
    /// Output files in declaration order
    #[prost(message, repeated, tag = "2")]
    pub output_files: Vec<OutputFile>,
    /// Output directories; must be empty
    #[prost(message, repeated, tag = "3")]
    pub output_directories: Vec<OutputDirectory>,
    /// Process exit code
    #[prost(int32, tag = "4")]
    pub exit_code: i32,
    /// Inline stdout
    #[prost(bytes = "vec", tag = "5")]
    pub stdout_raw: Vec<u8>,
    /// Digest of stdout when stored out of line
    #[prost(message, optional, tag = "6")]
    pub stdout_digest: Option<Digest>,
    /// Inline stderr
    #[prost(bytes = "vec", tag = "7")]
    pub stderr_raw: Vec<u8>,
    /// Digest of stderr when stored out of line
    #[prost(message, optional, tag = "8")]
    pub stderr_digest: Option<Digest>,
}

/// Decode a stored message, naming the message kind on failure
pub fn decode<M: Message + Default>(what: &'static str, bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|e| Error::decode(what, e))
}
