//! Destinations for an action's captured stdout and stderr

use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Files holding an action's stdout and stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutErr {
    /// Where stdout is written
    pub stdout_path: PathBuf,
    /// Where stderr is written
    pub stderr_path: PathBuf,
}

impl OutErr {
    /// Use explicit paths for both streams
    #[must_use]
    pub fn new(stdout_path: impl Into<PathBuf>, stderr_path: impl Into<PathBuf>) -> Self {
        Self {
            stdout_path: stdout_path.into(),
            stderr_path: stderr_path.into(),
        }
    }

    /// `dir/stdout` and `dir/stderr`
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("stdout"), dir.join("stderr"))
    }

    /// Captured stdout; empty when the file does not exist
    pub async fn read_stdout(&self) -> Result<Vec<u8>> {
        read_or_empty(&self.stdout_path).await
    }

    /// Captured stderr; empty when the file does not exist
    pub async fn read_stderr(&self) -> Result<Vec<u8>> {
        read_or_empty(&self.stderr_path).await
    }
}

async fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io(e, path, "read")),
    }
}
