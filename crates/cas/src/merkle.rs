//! Merkle tree builder for Directory messages
//!
//! Produces the leaves and serialized directories that [`ActionCache::ensure_inputs_present`]
//! uploads. Entries are sorted by name so identical contents always hash identically.
//!
//! [`ActionCache::ensure_inputs_present`]: crate::ActionCache::ensure_inputs_present

use crate::digest::{Digest, compute_digest_of_blocking_reader};
use crate::error::{Error, Result};
use crate::input::ActionInput;
use crate::proto::{self, DirectoryNode, FileNode};
use prost::Message;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Entry representing a file with its metadata
#[derive(Debug, Clone)]
struct FileEntry {
    digest: Digest,
    is_executable: bool,
    input: ActionInput,
}

/// A file in a built tree, addressed by its path from the tree root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLeaf {
    /// Path relative to the tree root
    pub path: PathBuf,
    /// Content digest
    pub digest: Digest,
    /// Whether the executable bit is set
    pub is_executable: bool,
    /// Where to read the content from when uploading
    pub input: ActionInput,
}

/// Result of building a directory tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// Root digest of the tree
    pub root_digest: Digest,
    /// Every directory with its serialized bytes, children before parents
    pub directories: Vec<(Digest, Vec<u8>)>,
    /// Every file in the tree
    pub leaves: Vec<TreeLeaf>,
}

/// Builder for constructing Merkle trees from file inputs
#[derive(Debug, Default)]
pub struct TreeBuilder {
    files: HashMap<String, FileEntry>,
    subdirs: HashMap<String, TreeBuilder>,
}

impl TreeBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from every file and directory under `root`
    ///
    /// Files become [`ActionInput::OnDisk`] leaves relative to `root`, so the
    /// tree should be uploaded with `root` as execution root.
    pub fn from_directory(root: &Path) -> Result<Self> {
        let mut builder = Self::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                match e.into_io_error() {
                    Some(io) => Error::io(io, path, "walk"),
                    None => Error::invalid_tree(format!("filesystem loop at {}", path.display())),
                }
            })?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| {
                    Error::invalid_tree(format!(
                        "path {} is not under root {}",
                        entry.path().display(),
                        root.display()
                    ))
                })?
                .to_path_buf();

            let file_type = entry.file_type();
            if file_type.is_dir() {
                builder.add_directory(&rel)?;
            } else if file_type.is_file() {
                let (digest, is_executable) = hash_file(entry.path())?;
                builder.add_file(&rel, digest, is_executable, ActionInput::OnDisk(rel.clone()))?;
            } else {
                return Err(Error::unsupported(format!(
                    "non-regular input {}",
                    entry.path().display()
                )));
            }
        }
        debug!(root = %root.display(), files = builder.file_count(), "Scanned input tree");
        Ok(builder)
    }

    /// Add a file whose digest has already been computed
    pub fn add_file(
        &mut self,
        path: impl AsRef<Path>,
        digest: Digest,
        is_executable: bool,
        input: ActionInput,
    ) -> Result<()> {
        let (parents, name) = split_path(path.as_ref())?;
        let dir = self.subdir_mut(&parents)?;
        if dir.subdirs.contains_key(&name) {
            return Err(Error::invalid_tree(format!(
                "{} is both a file and a directory",
                path.as_ref().display()
            )));
        }
        dir.files.insert(
            name,
            FileEntry {
                digest,
                is_executable,
                input,
            },
        );
        Ok(())
    }

    /// Add in-memory content, hashing it
    pub fn add_bytes(
        &mut self,
        path: impl AsRef<Path>,
        bytes: Vec<u8>,
        is_executable: bool,
    ) -> Result<()> {
        let digest = Digest::from_bytes(&bytes);
        self.add_file(path, digest, is_executable, ActionInput::in_memory(bytes))
    }

    /// Ensure a (possibly empty) directory exists in the tree
    pub fn add_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let (mut parents, name) = split_path(path.as_ref())?;
        parents.push(name);
        self.subdir_mut(&parents).map(|_| ())
    }

    fn subdir_mut(&mut self, components: &[String]) -> Result<&mut Self> {
        let mut dir = self;
        for name in components {
            if dir.files.contains_key(name) {
                return Err(Error::invalid_tree(format!(
                    "{name} is both a file and a directory"
                )));
            }
            dir = dir.subdirs.entry(name.clone()).or_default();
        }
        Ok(dir)
    }

    /// Build the Merkle tree and return the root digest with all directory blobs
    pub fn build(&self) -> MerkleTree {
        let mut directories = Vec::new();
        let mut leaves = Vec::new();
        let root_digest = self.build_recursive(Path::new(""), &mut directories, &mut leaves);
        MerkleTree {
            root_digest,
            directories,
            leaves,
        }
    }

    /// Recursively build directories bottom-up
    fn build_recursive(
        &self,
        prefix: &Path,
        directories: &mut Vec<(Digest, Vec<u8>)>,
        leaves: &mut Vec<TreeLeaf>,
    ) -> Digest {
        let mut directory_nodes = Vec::with_capacity(self.subdirs.len());
        let mut subdir_names: Vec<_> = self.subdirs.keys().collect();
        subdir_names.sort(); // Sort for determinism

        for name in subdir_names {
            let subdir_digest =
                self.subdirs[name].build_recursive(&prefix.join(name), directories, leaves);
            directory_nodes.push(DirectoryNode {
                name: name.clone(),
                digest: Some((&subdir_digest).into()),
            });
        }

        let mut file_nodes = Vec::with_capacity(self.files.len());
        let mut file_names: Vec<_> = self.files.keys().collect();
        file_names.sort();

        for name in file_names {
            let entry = &self.files[name];
            file_nodes.push(FileNode {
                name: name.clone(),
                digest: Some((&entry.digest).into()),
                is_executable: entry.is_executable,
            });
            leaves.push(TreeLeaf {
                path: prefix.join(name),
                digest: entry.digest.clone(),
                is_executable: entry.is_executable,
                input: entry.input.clone(),
            });
        }

        let directory = proto::Directory {
            files: file_nodes,
            directories: directory_nodes,
        };
        let bytes = directory.encode_to_vec();
        let digest = Digest::from_bytes(&bytes);
        directories.push((digest.clone(), bytes));
        digest
    }

    /// Get the number of files in this tree
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len() + self.subdirs.values().map(Self::file_count).sum::<usize>()
    }
}

/// Split a relative path into parent components and final name
fn split_path(path: &Path) -> Result<(Vec<String>, String)> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid_tree(format!(
                    "{} must be a relative path without '..'",
                    path.display()
                )));
            }
        }
    }
    let name = parts
        .pop()
        .ok_or_else(|| Error::invalid_tree("empty path"))?;
    Ok((parts, name))
}

/// Stream a file through SHA-256 and read its executable bit
fn hash_file(path: &Path) -> Result<(Digest, bool)> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let metadata = file.metadata().map_err(|e| Error::io(e, path, "stat"))?;
    let digest =
        compute_digest_of_blocking_reader(&mut file).map_err(|e| Error::io(e, path, "read"))?;
    Ok((digest, crate::fsutil::is_executable(&metadata)))
}
