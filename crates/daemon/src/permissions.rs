// Permission hardening for daemon files, directories and the socket

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

/// Set umask 0077 so every file the daemon creates starts owner-only.
/// Call before anything touches the filesystem.
pub fn set_restrictive_umask() {
    #[cfg(unix)]
    {
        // SAFETY: umask only swaps the process file mode mask
        unsafe {
            libc::umask(0o077);
        }
        debug!("Set restrictive umask: 0077");
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    debug!("Set permissions to {:o}: {}", mode, path.display());
    Ok(())
}

/// 0600 on Unix; no-op elsewhere
pub fn set_file_permissions_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    set_mode(path, 0o600)?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// 0660 with group access, otherwise 0600
pub fn set_socket_permissions(path: &Path, group_access: bool) -> Result<()> {
    #[cfg(unix)]
    set_mode(path, if group_access { 0o660 } else { 0o600 })?;
    #[cfg(not(unix))]
    let _ = (path, group_access);
    Ok(())
}

/// Create `path` if needed, then restrict it to 0700 (0770 with group access).
pub fn ensure_directory_with_permissions(path: &Path, group_access: bool) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
        debug!("Created directory: {}", path.display());
    }

    #[cfg(unix)]
    set_mode(path, if group_access { 0o770 } else { 0o700 })?;
    #[cfg(not(unix))]
    let _ = group_access;
    Ok(())
}
