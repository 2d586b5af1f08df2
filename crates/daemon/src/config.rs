// WG Tunnel Manager - Daemon Config Module
// Listener, storage, polling and backend command settings

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use wg_tunnel_common::is_loopback_address;

use crate::permissions;

const APP_DIR: &str = "wg-tunnel-manager";

/// Get the runtime directory for daemon state
pub fn runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .map(|dir| dir.join(APP_DIR))
        .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))
}

/// Get the socket path for the daemon
pub fn socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("wg-tunnel-manager.sock"))
}

fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Listener mode for the daemon
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// TCP with HTTP, loopback only
    TcpHttp,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind host for TCP mode
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for TCP mode
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    #[serde(default = "default_auth_token_path")]
    pub auth_token_path: PathBuf,

    /// Require authentication (recommended for TCP, optional for UnixSocket)
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,

    /// 0770/0660 on the runtime directory and socket instead of 0700/0600
    #[serde(default)]
    pub group_access: bool,

    /// Installation data directory. Encrypted configurations live under
    /// `<data_dir>/tunnels` and the storage key is derived from this path.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where per-activation configuration files are written
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Seconds between periodic status sweeps
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Delay before the confirming probe after a transition
    #[serde(default = "default_reprobe_delay_ms")]
    pub reprobe_delay_ms: u64,

    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    3443
}

fn default_auth_token_path() -> PathBuf {
    app_config_dir().join("daemon.token")
}

fn default_require_auth() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_reprobe_delay_ms() -> u64 {
    2000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            auth_token_path: default_auth_token_path(),
            require_auth: default_require_auth(),
            group_access: false,
            data_dir: default_data_dir(),
            temp_dir: default_temp_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            reprobe_delay_ms: default_reprobe_delay_ms(),
            backend: BackendConfig::default(),
        }
    }
}

/// Command templates for each backend mechanism.
///
/// `{name}` expands to the tunnel name and `{config}` to the path of the
/// per-activation configuration file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub primary_executable: String,
    /// Checked before the executable search path
    pub well_known_dirs: Vec<PathBuf>,
    /// Tools usually installed next to the primary executable
    pub sibling_tools: Vec<String>,
    pub primary_activate_args: Vec<String>,
    pub primary_deactivate_args: Vec<String>,
    pub primary_status_args: Vec<String>,
    pub primary_running_marker: String,

    pub service_program: String,
    pub service_start_args: Vec<String>,
    pub service_stop_args: Vec<String>,
    pub service_query_args: Vec<String>,
    pub service_running_marker: String,
    /// Exit codes meaning "no such service" rather than a failed start
    pub service_missing_exit_codes: Vec<i32>,

    pub quick_script: String,
    pub quick_up_args: Vec<String>,
    pub quick_down_args: Vec<String>,
    pub show_tool: String,
    pub show_args: Vec<String>,

    pub adapter_program: String,
    pub adapter_up_args: Vec<String>,
    pub interface_list_program: String,
    pub interface_list_args: Vec<String>,
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for BackendConfig {
    fn default() -> Self {
        let mut config = Self {
            primary_executable: "wireguard".to_string(),
            well_known_dirs: default_well_known_dirs(),
            sibling_tools: args(&["wg", "wg-quick"]),
            primary_activate_args: args(&["/installtunnelservice", "{config}"]),
            primary_deactivate_args: args(&["/uninstalltunnelservice", "{name}"]),
            primary_status_args: args(&["/tunnelstatus", "{name}"]),
            primary_running_marker: "Running".to_string(),

            service_program: "systemctl".to_string(),
            service_start_args: args(&["start", "wg-quick@{name}"]),
            service_stop_args: args(&["stop", "wg-quick@{name}"]),
            service_query_args: args(&["is-active", "wg-quick@{name}"]),
            service_running_marker: "active".to_string(),
            service_missing_exit_codes: vec![5],

            quick_script: "wg-quick".to_string(),
            quick_up_args: args(&["up", "{config}"]),
            quick_down_args: args(&["down", "{name}"]),
            show_tool: "wg".to_string(),
            show_args: args(&["show", "{name}"]),

            adapter_program: "ip".to_string(),
            adapter_up_args: args(&["link", "set", "{name}", "up"]),
            interface_list_program: "ip".to_string(),
            interface_list_args: args(&["link", "show"]),
        };

        if cfg!(windows) {
            config.service_program = "sc".to_string();
            config.service_start_args = args(&["start", "WireGuardTunnel${name}"]);
            config.service_stop_args = args(&["stop", "WireGuardTunnel${name}"]);
            config.service_query_args = args(&["query", "WireGuardTunnel${name}"]);
            config.service_running_marker = "RUNNING".to_string();
            config.service_missing_exit_codes = vec![1060];
            config.adapter_program = "powershell".to_string();
            config.adapter_up_args = args(&[
                "-NoProfile",
                "-NonInteractive",
                "-Command",
                "Enable-NetAdapter -Name '{name}' -Confirm:$false",
            ]);
            config.interface_list_program = "netsh".to_string();
            config.interface_list_args = args(&["interface", "show", "interface"]);
        }

        config
    }
}

fn default_well_known_dirs() -> Vec<PathBuf> {
    if cfg!(windows) {
        let program_files = std::env::var_os("ProgramFiles")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
        let program_files_x86 = std::env::var_os("ProgramFiles(x86)")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Program Files (x86)"));

        let mut dirs_found = vec![
            program_files.join("WireGuard"),
            program_files_x86.join("WireGuard"),
            program_files.join("WireGuard").join("bin"),
            program_files_x86.join("WireGuard").join("bin"),
            program_files.join("WireGuard UI"),
            program_files_x86.join("WireGuard UI"),
        ];
        if let Some(local) = dirs::data_local_dir() {
            dirs_found.push(local.join("WireGuard"));
            dirs_found.push(local.join("Programs").join("WireGuard"));
        }
        dirs_found
    } else {
        let mut dirs_found = vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/usr/sbin"),
            PathBuf::from("/opt/homebrew/bin"),
        ];
        if let Some(home) = dirs::home_dir() {
            dirs_found.push(home.join(".local").join("bin"));
        }
        dirs_found
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<()> {
        let programs = [
            ("primary_executable", &self.primary_executable),
            ("service_program", &self.service_program),
            ("quick_script", &self.quick_script),
            ("show_tool", &self.show_tool),
            ("adapter_program", &self.adapter_program),
            ("interface_list_program", &self.interface_list_program),
        ];
        for (field, value) in programs {
            if value.trim().is_empty() {
                anyhow::bail!("backend.{} must not be empty", field);
            }
        }
        if !self.primary_activate_args.iter().any(|a| a.contains("{config}"))
            && !self.quick_up_args.iter().any(|a| a.contains("{config}"))
        {
            anyhow::bail!(
                "backend activation templates never reference {{config}}; \
                 at least one of primary_activate_args or quick_up_args must"
            );
        }
        Ok(())
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener_mode == ListenerMode::TcpHttp && !is_loopback_address(&self.bind_host) {
            anyhow::bail!(
                "Security violation: tcp-http may only bind to a loopback address (bind_host: {}).\n\
                 Use 127.0.0.1, ::1 or localhost, or switch listener_mode to 'unix-socket'.",
                self.bind_host
            );
        }

        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be at least 1");
        }

        self.backend.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reprobe_delay(&self) -> Duration {
        Duration::from_millis(self.reprobe_delay_ms)
    }

    /// Load daemon configuration from the default location, writing the
    /// defaults there on first start.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        fs::write(config_path, contents).context("Failed to write daemon configuration")?;
        permissions::set_file_permissions_private(config_path)?;

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join(APP_DIR).join("daemon.toml"))
    }
}

/// Render the CLI config that matches this daemon's listener
fn cli_config_snippet(
    listener_mode: &ListenerMode,
    bind_host: &str,
    bind_port: u16,
    auth_token: Option<&str>,
    socket: &str,
) -> String {
    let mut content = String::from(
        "# CLI Configuration for WG Tunnel Manager\n\
         # Copy this to ~/.config/wg-tunnel-manager/cli.toml\n\n",
    );
    match listener_mode {
        ListenerMode::UnixSocket => {
            content.push_str("connection_mode = \"unix-socket\"\n");
            content.push_str(&format!(
                "# Socket path (auto-detected by default): {}\n# daemon_url = \"{}\"\n",
                socket, socket
            ));
        }
        ListenerMode::TcpHttp => {
            content.push_str("connection_mode = \"http\"\n");
            content.push_str(&format!("daemon_host = \"{}\"\n", bind_host));
            content.push_str(&format!("daemon_port = {}\n", bind_port));
        }
    }
    if let Some(token) = auth_token {
        content.push_str(&format!("auth_token = \"{}\"\n", token));
    }
    content
}

/// Write CLI config snippet to help users configure their CLI
pub fn write_cli_config_snippet(
    listener_mode: &ListenerMode,
    bind_host: &str,
    bind_port: u16,
    auth_token: Option<&str>,
) -> Result<()> {
    let snippet_path = app_config_dir().join("cli-config.snippet");
    if let Some(parent) = snippet_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let socket = socket_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "auto-detect".to_string());
    let content = cli_config_snippet(listener_mode, bind_host, bind_port, auth_token, &socket);

    fs::write(&snippet_path, content).context("Failed to write CLI config snippet")?;
    permissions::set_file_permissions_private(&snippet_path)?;

    info!("CLI configuration snippet written to {}", snippet_path.display());
    info!(
        "To configure the CLI, run: cp {} ~/.config/wg-tunnel-manager/cli.toml",
        snippet_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_default_unix_install_dirs() {
        let found = default_well_known_dirs();
        let mut expected: Vec<PathBuf> = ["/usr/bin", "/usr/local/bin", "/usr/sbin", "/opt/homebrew/bin"]
            .iter()
            .map(PathBuf::from)
            .collect();
        if let Some(home) = dirs::home_dir() {
            expected.push(home.join(".local/bin"));
        }
        assert_eq!(found, expected);
        assert_eq!(BackendConfig::default().well_known_dirs, expected);
    }

    #[test]
    fn test_validate_unix_socket_mode() {
        let config = DaemonConfig {
            listener_mode: ListenerMode::UnixSocket,
            bind_host: "0.0.0.0".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_tcp_http_loopback() {
        for host in ["127.0.0.1", "localhost", "::1"] {
            let config = DaemonConfig {
                listener_mode: ListenerMode::TcpHttp,
                bind_host: host.to_string(),
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "{} should be accepted", host);
        }
    }

    #[test]
    fn test_validate_tcp_http_non_loopback_rejected() {
        let config = DaemonConfig {
            listener_mode: ListenerMode::TcpHttp,
            bind_host: "0.0.0.0".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Security violation"));
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = DaemonConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_backend_program() {
        let mut config = DaemonConfig::default();
        config.backend.quick_script = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert!(config.require_auth);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.reprobe_delay(), Duration::from_millis(2000));
        assert_eq!(config.backend.primary_executable, "wireguard");
    }

    #[test]
    fn test_load_writes_defaults_then_reads_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("daemon.toml");

        let first = DaemonConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(first.poll_interval_secs, 10);

        fs::write(
            &path,
            "poll_interval_secs = 30\n[backend]\nquick_script = \"/opt/wg-quick\"\n",
        )
        .unwrap();
        let loaded = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(loaded.poll_interval_secs, 30);
        assert_eq!(loaded.backend.quick_script, "/opt/wg-quick");
        // Unset backend fields keep their defaults
        assert_eq!(loaded.backend.show_tool, "wg");
    }

    #[test]
    fn test_cli_snippet_for_tcp() {
        let snippet = cli_config_snippet(
            &ListenerMode::TcpHttp,
            "127.0.0.1",
            4000,
            Some("secret"),
            "/run/x.sock",
        );
        assert!(snippet.contains("connection_mode = \"http\""));
        assert!(snippet.contains("daemon_port = 4000"));
        assert!(snippet.contains("auth_token = \"secret\""));
    }
}
