// WG Tunnel Manager - Privilege Check
// Installing and removing tunnel services needs elevated rights

use tracing::debug;

/// A warning for the user when the daemon cannot manage tunnel services,
/// `None` when it can.
pub fn check() -> Option<String> {
    if is_elevated() {
        debug!("Running with elevated privileges");
        None
    } else {
        Some(warning_message().to_string())
    }
}

#[cfg(unix)]
fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(unix)]
fn warning_message() -> &'static str {
    "The daemon is not running as root. Activating and deactivating tunnels will likely fail."
}

/// Writing into the Windows directory requires an elevated token.
#[cfg(windows)]
fn is_elevated() -> bool {
    let Some(windir) = std::env::var_os("WINDIR") else {
        return false;
    };
    let probe = std::path::Path::new(&windir).join(format!(
        "wg-tunnel-manager-{}.tmp",
        std::process::id()
    ));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn warning_message() -> &'static str {
    "The daemon is not running as Administrator. Activating and deactivating tunnels will likely fail."
}

#[cfg(not(any(unix, windows)))]
fn is_elevated() -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
fn warning_message() -> &'static str {
    "Unable to determine whether the daemon can manage tunnel services."
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_check_matches_euid() {
        let root = unsafe { libc::geteuid() } == 0;
        assert_eq!(check().is_none(), root);
    }
}
