//! Moving whole directory trees to and from the store

use crate::digest::{Digest, require_digest};
use crate::error::{Error, Result};
use crate::input::ActionInput;
use crate::merkle::{MerkleTree, TreeLeaf};
use crate::proto::{self, Command};
use crate::transfer::BlobTransfer;
use prost::Message;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

impl BlobTransfer {
    /// Upload the command, every directory, then every leaf of `tree`
    ///
    /// On-disk leaves are read relative to `exec_root`. Leaves already present
    /// in the store are not uploaded again.
    #[instrument(skip_all, fields(root = %tree.root_digest, leaves = tree.leaves.len()))]
    pub async fn ensure_inputs_present(
        &self,
        exec_root: &Path,
        tree: &MerkleTree,
        command: &Command,
    ) -> Result<()> {
        self.upload_blob(&command.encode_to_vec()).await?;

        for (digest, bytes) in &tree.directories {
            let mut reader = bytes.as_slice();
            self.upload_blob_stream(digest, &mut reader).await?;
        }

        let mut uploaded = 0usize;
        for leaf in &tree.leaves {
            if self.contains_key(&leaf.digest).await? {
                continue;
            }
            self.upload_leaf(exec_root, leaf).await?;
            uploaded += 1;
        }

        debug!(
            directories = tree.directories.len(),
            uploaded, "Inputs present in blob store"
        );
        Ok(())
    }

    async fn upload_leaf(&self, exec_root: &Path, leaf: &TreeLeaf) -> Result<Digest> {
        match &leaf.input {
            ActionInput::InMemory(bytes) => self.upload_blob(bytes).await,
            ActionInput::OnDisk(_) => {
                let mut reader = leaf.input.open(exec_root).await?;
                self.upload_blob_stream(&leaf.digest, &mut *reader).await
            }
        }
    }

    /// Materialize the tree rooted at `root_digest` under `dest`
    ///
    /// Walks the tree with an explicit stack, so depth is bounded only by
    /// memory, and checks for cancellation before each directory.
    #[instrument(skip(self, root_digest, dest), fields(root = %root_digest, dest = %dest.display()))]
    pub async fn download_tree(&self, root_digest: &Digest, dest: &Path) -> Result<()> {
        let mut pending: Vec<(Digest, PathBuf)> = vec![(root_digest.clone(), dest.to_path_buf())];
        let mut files = 0usize;

        while let Some((digest, location)) = pending.pop() {
            self.check_cancelled("tree download")?;

            let bytes = self.download_blob(&digest).await?;
            let directory: proto::Directory = proto::decode("Directory", &bytes)?;

            fs::create_dir_all(&location)
                .await
                .map_err(|e| Error::io(e, &location, "create_dir_all"))?;

            for file in &directory.files {
                let file_digest = require_digest(file.digest.as_ref(), "file digest")?;
                let path = location.join(entry_name(&file.name)?);
                self.download_file(&file_digest, &path, file.is_executable)
                    .await?;
                files += 1;
            }

            // Reverse so children pop in the order the directory lists them.
            for child in directory.directories.iter().rev() {
                let child_digest = require_digest(child.digest.as_ref(), "directory digest")?;
                pending.push((child_digest, location.join(entry_name(&child.name)?)));
            }
        }

        debug!(files, "Materialized tree");
        Ok(())
    }
}

/// A directory entry name must be exactly one normal path component
fn entry_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(Error::invalid_tree(format!("invalid entry name {name:?}"))),
    }
}
