// WG Tunnel Manager - CLI Config Module
// Where the CLI finds the daemon; the connection logic lives in wg-tunnel-common

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};

use wg_tunnel_common::daemon_client::{validate_daemon_config, ConfigValidationResult};
pub use wg_tunnel_common::DaemonClientConfig;

/// CLI configuration (wrapper around DaemonClientConfig with file I/O)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(flatten)]
    pub daemon_config: DaemonClientConfig,
}

impl CliConfig {
    /// Load CLI configuration from file, falling back to defaults.
    ///
    /// When no file exists but the daemon left a snippet, the user is told
    /// where it is.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        match validate_daemon_config(&config_path) {
            ConfigValidationResult::Valid => Self::load_from(&config_path),
            ConfigValidationResult::MissingConfigSnippetAvailable(snippet) => {
                eprintln!(
                    "{} no CLI config at {}",
                    "Note:".yellow().bold(),
                    config_path.display()
                );
                eprintln!(
                    "  The daemon generated one; install it with: {}",
                    format!("cp {} {}", snippet.display(), config_path.display()).cyan()
                );
                Ok(Self::default())
            }
            ConfigValidationResult::MissingConfigNoSnippet => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context("Failed to read CLI configuration")?;
        let config: Self = toml::from_str(&contents).context("Failed to parse CLI configuration")?;
        Ok(config)
    }

    /// Get the path to the CLI configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("wg-tunnel-manager").join("cli.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wg_tunnel_common::ConnectionMode;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(
            config.daemon_config.connection_mode,
            ConnectionMode::UnixSocket
        );
        assert!(config.daemon_config.auth_token.is_empty());
    }

    #[test]
    fn test_load_daemon_snippet() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cli.toml");
        fs::write(
            &path,
            "# CLI Configuration for WG Tunnel Manager\n\
             connection_mode = \"http\"\n\
             daemon_host = \"127.0.0.1\"\n\
             daemon_port = 4100\n\
             auth_token = \"secret\"\n",
        )
        .unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon_config.connection_mode, ConnectionMode::Http);
        assert_eq!(config.daemon_config.auth_token, "secret");
        assert_eq!(
            config.daemon_config.daemon_base_url().unwrap(),
            "http://127.0.0.1:4100"
        );
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cli.toml");
        fs::write(&path, "connection_mode = \"unix-socket\"\n").unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.daemon_config.daemon_port, 3443);
        assert_eq!(
            config.daemon_config.daemon_base_url().unwrap(),
            "http://daemon"
        );
    }
}
