//! Sources of action input bytes

use crate::error::{Error, Result};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Where the bytes of one action input come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionInput {
    /// A file under the execution root, by relative path
    OnDisk(PathBuf),
    /// Content synthesized in memory (e.g. a generated parameter file)
    InMemory(Arc<[u8]>),
}

impl ActionInput {
    /// In-memory input from owned bytes
    #[must_use]
    pub fn in_memory(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::InMemory(bytes.into())
    }

    /// Open the input for reading, resolving on-disk paths against `exec_root`
    pub async fn open(&self, exec_root: &Path) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        match self {
            Self::OnDisk(rel) => {
                let path = exec_root.join(rel);
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| Error::io(e, &path, "open"))?;
                Ok(Box::new(file))
            }
            Self::InMemory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_open_in_memory() {
        let input = ActionInput::in_memory(b"virtual".to_vec());
        let mut reader = input.open(Path::new("/nonexistent")).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"virtual");
    }

    #[tokio::test]
    async fn test_open_on_disk_resolves_against_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("in.txt"), b"disk").unwrap();

        let input = ActionInput::OnDisk(PathBuf::from("in.txt"));
        let mut reader = input.open(tmp.path()).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"disk");
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = ActionInput::OnDisk(PathBuf::from("missing"));
        assert!(matches!(
            input.open(tmp.path()).await,
            Err(Error::Io { .. })
        ));
    }
}
