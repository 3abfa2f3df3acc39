//! Small filesystem helpers shared by the transfer paths

use crate::error::{Error, Result};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

/// Whether any execute bit is set
#[cfg(unix)]
pub(crate) fn is_executable(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_metadata: &Metadata) -> bool {
    false
}

/// Set or clear the executable bits, leaving the read/write bits intact
#[cfg(unix)]
pub(crate) async fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| Error::io(e, path, "stat"))?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    permissions.set_mode(if executable {
        mode | 0o111
    } else {
        mode & !0o111
    });
    fs::set_permissions(path, permissions)
        .await
        .map_err(|e| Error::io(e, path, "chmod"))
}

#[cfg(not(unix))]
pub(crate) async fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

/// Create the parent directory of `path` if it has one
pub(crate) async fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    Ok(())
}

/// Delete a file; a path that does not exist counts as deleted
pub(crate) async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
