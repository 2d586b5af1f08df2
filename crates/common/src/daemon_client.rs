// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

// WG Tunnel Manager - Daemon Client Module
// Shared daemon connection logic for the CLI

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::sse::EventListener;
use crate::tunnel_config::tunnel_name;
use crate::types::{
    ExportResult, ImportRequest, ImportResult, LifecycleResult, StatusCheck, TunnelEvent,
    TunnelSummary,
};

/// Header carrying the daemon auth token
pub const AUTH_HEADER: &str = "X-Tunnel-Token";

const RUNTIME_SUBDIR: &str = "wg-tunnel-manager";
const SOCKET_FILE: &str = "wg-tunnel-manager.sock";

/// Connection mode for client to daemon communication
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (local-only)
    #[default]
    UnixSocket,
    /// Plain HTTP on a loopback address
    Http,
}

/// Client configuration for connecting to daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Daemon host for HTTP mode
    #[serde(default = "default_daemon_host")]
    pub daemon_host: String,

    /// Daemon port for HTTP mode
    #[serde(default = "default_daemon_port")]
    pub daemon_port: u16,

    /// Socket path override for UnixSocket mode (optional)
    #[serde(default)]
    pub daemon_url: String,

    /// Authentication token (if daemon requires auth)
    #[serde(default)]
    pub auth_token: String,
}

fn default_daemon_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    3443
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            connection_mode: ConnectionMode::default(),
            daemon_host: default_daemon_host(),
            daemon_port: default_daemon_port(),
            daemon_url: String::new(),
            auth_token: String::new(),
        }
    }
}

impl DaemonClientConfig {
    /// Base URL for API requests. Unix socket mode uses a placeholder host.
    pub fn daemon_base_url(&self) -> Result<String> {
        match self.connection_mode {
            ConnectionMode::UnixSocket => Ok("http://daemon".to_string()),
            ConnectionMode::Http => {
                if self.daemon_host.is_empty() {
                    anyhow::bail!("daemon_host is required for HTTP mode");
                }
                let host_port = crate::format_host_port(&self.daemon_host, self.daemon_port);
                Ok(format!("http://{}", host_port))
            }
        }
    }

    /// Get the Unix socket path (for UnixSocket mode)
    ///
    /// Checks, in order: an explicit path in `daemon_url`, the user runtime
    /// directory, then the system-wide location.
    pub fn socket_path(&self) -> Result<PathBuf> {
        let candidate = self.daemon_url.trim();
        if !candidate.is_empty()
            && (candidate.starts_with('/') || candidate.starts_with("./") || candidate.starts_with("../"))
        {
            return Ok(PathBuf::from(candidate));
        }

        let user_socket = dirs::runtime_dir().map(|runtime_dir| user_socket_path(&runtime_dir));
        if let Some(path) = &user_socket {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let system_socket = PathBuf::from("/run")
            .join(RUNTIME_SUBDIR)
            .join(SOCKET_FILE);
        if system_socket.exists() {
            return Ok(system_socket);
        }

        // Neither exists yet; the user-mode daemon will create this one
        user_socket.ok_or_else(|| {
            anyhow::anyhow!("Could not determine runtime directory and no system socket found")
        })
    }
}

fn user_socket_path(runtime_dir: &Path) -> PathBuf {
    if runtime_dir.file_name() == Some(OsStr::new(RUNTIME_SUBDIR)) {
        runtime_dir.join(SOCKET_FILE)
    } else {
        runtime_dir.join(RUNTIME_SUBDIR).join(SOCKET_FILE)
    }
}

/// Validate daemon client configuration completeness
pub fn validate_client_config(config: &DaemonClientConfig) -> Result<()> {
    if config.connection_mode == ConnectionMode::Http && config.daemon_host.is_empty() {
        anyhow::bail!(
            "daemon_host is required for HTTP mode but is empty. \
             Specify the loopback address the daemon listens on (e.g., 127.0.0.1)"
        );
    }
    Ok(())
}

/// Build a client for short request/response calls.
pub fn create_daemon_client(config: &DaemonClientConfig) -> Result<Client> {
    build_client(config, Some(Duration::from_secs(30)))
}

/// Build a client without a total timeout, for the event stream.
pub fn create_event_client(config: &DaemonClientConfig) -> Result<Client> {
    build_client(config, None)
}

fn build_client(config: &DaemonClientConfig, timeout: Option<Duration>) -> Result<Client> {
    let mut client_builder = Client::builder().connect_timeout(Duration::from_secs(5));
    if let Some(timeout) = timeout {
        client_builder = client_builder.timeout(timeout);
    }

    match config.connection_mode {
        ConnectionMode::UnixSocket => {
            #[cfg(unix)]
            {
                let socket_path = config.socket_path()?;
                client_builder = client_builder.unix_socket(socket_path);
            }
            #[cfg(not(unix))]
            anyhow::bail!("unix-socket mode is not available on this platform; use http");
        }
        ConnectionMode::Http => {}
    }

    client_builder
        .build()
        .context("Failed to build daemon client")
}

/// Add authentication header to request if configured
pub fn add_auth_header(
    request: reqwest::RequestBuilder,
    config: &DaemonClientConfig,
) -> Result<reqwest::RequestBuilder> {
    if !config.auth_token.is_empty() {
        Ok(request.header(AUTH_HEADER, &config.auth_token))
    } else {
        Ok(request)
    }
}

/// Get the path to the daemon-generated CLI config snippet
pub fn get_cli_config_snippet_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(config_dir.join(RUNTIME_SUBDIR).join("cli-config.snippet"))
}

/// Result type for config validation
#[derive(Debug)]
pub enum ConfigValidationResult {
    /// Config is valid and ready to use
    Valid,
    /// Config file doesn't exist but snippet is available
    MissingConfigSnippetAvailable(PathBuf),
    /// Config file doesn't exist and no snippet available
    MissingConfigNoSnippet,
}

/// Check for a CLI config before the first daemon call so the user gets a
/// pointer to the generated snippet instead of a bare 401.
pub fn validate_daemon_config(config_path: &Path) -> ConfigValidationResult {
    if config_path.exists() {
        return ConfigValidationResult::Valid;
    }

    if let Ok(snippet_path) = get_cli_config_snippet_path() {
        if snippet_path.exists() {
            return ConfigValidationResult::MissingConfigSnippetAvailable(snippet_path);
        }
    }

    ConfigValidationResult::MissingConfigNoSnippet
}

// ============================================================================
// Tunnel API calls
// ============================================================================

/// Parse a JSON body. The daemon answers errors with the same shape as
/// successes, so the body is read regardless of status.
async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        anyhow::bail!(
            "Authentication failed: 401 Unauthorized. \
             Copy the daemon's cli-config.snippet into cli.toml or set auth_token"
        );
    }
    let body = response
        .text()
        .await
        .with_context(|| format!("Failed to read {} response", what))?;
    serde_json::from_str(&body)
        .with_context(|| format!("Unexpected {} response ({}): {}", what, status, body))
}

fn tunnel_url(config: &DaemonClientConfig, name: &str, suffix: &str) -> Result<String> {
    let name = tunnel_name(name)?;
    Ok(format!(
        "{}/api/tunnels/{}{}",
        config.daemon_base_url()?,
        name,
        suffix
    ))
}

pub async fn list_tunnels(client: &Client, config: &DaemonClientConfig) -> Result<Vec<TunnelSummary>> {
    let url = format!("{}/api/tunnels", config.daemon_base_url()?);
    let resp = add_auth_header(client.get(&url), config)?
        .send()
        .await
        .context("Failed to connect to daemon. Is the daemon running?")?;
    read_json(resp, "list").await
}

pub async fn import_config(
    client: &Client,
    config: &DaemonClientConfig,
    source_name: &str,
    text: &str,
) -> Result<ImportResult> {
    let url = format!("{}/api/tunnels", config.daemon_base_url()?);
    let request = ImportRequest {
        source_name: source_name.to_string(),
        text: text.to_string(),
    };
    let resp = add_auth_header(client.post(&url).json(&request), config)?
        .send()
        .await
        .context("Failed to send import request to daemon")?;
    read_json(resp, "import").await
}

pub async fn export_config(
    client: &Client,
    config: &DaemonClientConfig,
    name: &str,
) -> Result<ExportResult> {
    let url = tunnel_url(config, name, "/config")?;
    let resp = add_auth_header(client.get(&url), config)?
        .send()
        .await
        .context("Failed to send export request to daemon")?;
    read_json(resp, "export").await
}

pub async fn remove_config(
    client: &Client,
    config: &DaemonClientConfig,
    name: &str,
) -> Result<LifecycleResult> {
    let url = tunnel_url(config, name, "")?;
    let resp = add_auth_header(client.delete(&url), config)?
        .send()
        .await
        .context("Failed to send remove request to daemon")?;
    read_json(resp, "remove").await
}

pub async fn activate_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    name: &str,
) -> Result<LifecycleResult> {
    let url = tunnel_url(config, name, "/activate")?;
    let resp = add_auth_header(client.post(&url), config)?
        .send()
        .await
        .context("Failed to send activate request to daemon")?;
    read_json(resp, "activate").await
}

pub async fn deactivate_tunnel(
    client: &Client,
    config: &DaemonClientConfig,
    name: &str,
) -> Result<LifecycleResult> {
    let url = tunnel_url(config, name, "/deactivate")?;
    let resp = add_auth_header(client.post(&url), config)?
        .send()
        .await
        .context("Failed to send deactivate request to daemon")?;
    read_json(resp, "deactivate").await
}

/// Ask the daemon to re-probe one tunnel, or all of them.
pub async fn check_status(
    client: &Client,
    config: &DaemonClientConfig,
    name: Option<&str>,
) -> Result<StatusCheck> {
    let url = match name {
        Some(name) => tunnel_url(config, name, "/status")?,
        None => format!("{}/api/status", config.daemon_base_url()?),
    };
    let resp = add_auth_header(client.post(&url), config)?
        .send()
        .await
        .context("Failed to send status request to daemon")?;
    read_json(resp, "status").await
}

// ============================================================================
// SSE-first lifecycle flow
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Activate,
    Deactivate,
}

impl LifecycleAction {
    fn expected_state(&self) -> bool {
        matches!(self, LifecycleAction::Activate)
    }
}

/// Callback for events observed while a transition settles
pub trait TransitionHandler: Send {
    fn on_event(&mut self, _event: &TunnelEvent) {}
}

/// What the client learned about a transition
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub result: LifecycleResult,
    /// State after the settle window. `None` when no event stream was available.
    pub settled_state: Option<bool>,
    /// Error carried by a failure event for this tunnel, if one arrived
    pub event_error: Option<String>,
}

/// Run activate/deactivate with the event stream subscribed first, then wait
/// up to `settle` for the daemon's confirming probe to contradict the
/// optimistic result.
pub async fn run_transition_with_events<H: TransitionHandler>(
    client: &Client,
    config: &DaemonClientConfig,
    name: &str,
    action: LifecycleAction,
    settle: Duration,
    handler: &mut H,
) -> Result<TransitionOutcome> {
    let name = tunnel_name(name)?;

    // Subscribe before sending so the optimistic event is not missed
    let mut events = match EventListener::new(config.clone()).subscribe_once().await {
        Ok(rx) => Some(rx),
        Err(e) => {
            tracing::warn!("Event stream unavailable, skipping confirmation: {}", e);
            None
        }
    };

    let result = match action {
        LifecycleAction::Activate => activate_tunnel(client, config, &name).await?,
        LifecycleAction::Deactivate => deactivate_tunnel(client, config, &name).await?,
    };

    let mut outcome = TransitionOutcome {
        result,
        settled_state: None,
        event_error: None,
    };
    if !outcome.result.success || !outcome.result.pending {
        return Ok(outcome);
    }
    let Some(rx) = events.as_mut() else {
        return Ok(outcome);
    };

    let mut state = action.expected_state();
    let deadline = tokio::time::sleep(settle);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            maybe_event = rx.recv() => {
                let Some(event) = maybe_event else {
                    return Ok(outcome);
                };
                handler.on_event(&event);
                if let TunnelEvent::TunnelStatus { name: event_name, active, success, error, .. } = event {
                    if event_name != name {
                        continue;
                    }
                    state = active;
                    if !success {
                        outcome.event_error = error;
                        break;
                    }
                }
            }
        }
    }

    outcome.settled_state = Some(state);
    Ok(outcome)
}
