// WG Tunnel Manager - PID File Management
// Ensures only one daemon instance runs at a time

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Holds the PID file for the lifetime of the daemon; removes it on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the PID file in the runtime directory.
    pub fn create() -> Result<Self> {
        Self::create_at(crate::config::runtime_dir()?.join("daemon.pid"))
    }

    /// Claim `path`, failing if it names a live process. Stale or
    /// unreadable files are replaced.
    pub fn create_at(path: PathBuf) -> Result<Self> {
        if let Some(pid) = Self::read_pid(&path) {
            if is_process_running(pid) {
                anyhow::bail!(
                    "Daemon is already running with PID {}. \
                     Stop the existing daemon first or remove {} if it's stale.",
                    pid,
                    path.display()
                );
            }
            warn!("Found stale PID file for process {} (not running), removing it", pid);
        }
        if path.exists() {
            fs::remove_file(&path).context("Failed to remove stale PID file")?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;
        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self { path })
    }

    fn read_pid(path: &Path) -> Option<u32> {
        match fs::read_to_string(path) {
            Ok(contents) => contents.trim().parse().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read PID file {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM means the process exists under another user
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    warn!("Process existence check not implemented for this platform");
    true
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_prevents_multiple_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.pid");

        let first = PidFileGuard::create_at(path.clone()).unwrap();
        let second = PidFileGuard::create_at(path.clone());
        assert!(second.unwrap_err().to_string().contains("already running"));

        drop(first);
        assert!(!path.exists());
        let _again = PidFileGuard::create_at(path).unwrap();
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.pid");
        fs::write(&path, "999999999").unwrap();

        let _guard = PidFileGuard::create_at(path.clone()).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
