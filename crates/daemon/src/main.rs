// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

// WG Tunnel Manager - Daemon
// Owns the tunnel store and drives the platform's tunnel backend

mod activation;
mod api;
mod auth;
mod cascade;
mod config;
mod deactivation;
mod discovery;
mod events;
mod manager;
mod mechanism;
mod monitor;
mod permissions;
mod pidfile;
mod privileges;
mod process;
mod registry;
mod store;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
#[cfg(unix)]
use hyper_util::rt::TokioIo;
#[cfg(unix)]
use tokio::net::UnixListener;
#[cfg(unix)]
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use auth::ApiToken;
use config::{DaemonConfig, ListenerMode};
use discovery::MechanismDiscovery;
use manager::{ManagerSettings, TunnelManager};
use mechanism::DiscoveredMechanisms;
use process::SystemRunner;

#[tokio::main]
async fn main() -> Result<()> {
    // Set restrictive umask before creating any files
    permissions::set_restrictive_umask();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wg_tunnel_daemon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("WG Tunnel Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Create PID file to prevent multiple instances
    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);
    info!("Authentication required: {}", daemon_config.require_auth);

    let (auth_token, token_was_generated) = if daemon_config.require_auth {
        let (token, was_new) = ApiToken::load_or_create(&daemon_config.auth_token_path)?;
        (Some(token), was_new)
    } else {
        info!("Authentication disabled - API endpoints are publicly accessible");
        (None, false)
    };

    if token_was_generated {
        config::write_cli_config_snippet(
            &daemon_config.listener_mode,
            &daemon_config.bind_host,
            daemon_config.bind_port,
            auth_token.as_ref().map(|t| t.expose()),
        )?;
    }

    let runner = Arc::new(SystemRunner);
    let mechanisms = Arc::new(DiscoveredMechanisms::new(
        MechanismDiscovery::new(&daemon_config.backend),
        daemon_config.backend.clone(),
        runner,
    ));
    let settings = ManagerSettings {
        data_dir: daemon_config.data_dir.clone(),
        temp_dir: daemon_config.temp_dir.clone(),
        reprobe_delay: daemon_config.reprobe_delay(),
        poll_interval: daemon_config.poll_interval(),
    };
    let manager =
        TunnelManager::new(settings, mechanisms).context("Failed to open the tunnel store")?;

    if let Some(message) = privileges::check() {
        warn!("{}", message);
        manager.warn_privileges(message);
    }

    // Log every event the daemon publishes
    let mut event_rx = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!("Tunnel event: {:?}", event);
        }
    });

    // Create shutdown broadcast channel for the monitor and SSE streams
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let monitor_task = manager.spawn_monitor(shutdown_tx.subscribe());

    let state = Arc::new(AppState {
        manager,
        shutdown_tx: shutdown_tx.clone(),
    });

    let app = if let Some(token) = auth_token {
        info!("API token: {}", token.obfuscated());
        create_router(state).layer(axum::middleware::from_fn_with_state(
            token,
            auth::require_token,
        ))
    } else {
        create_router(state)
    };
    let app = app.layer(TraceLayer::new_for_http());

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            #[cfg(unix)]
            serve_unix_socket(app, &daemon_config, shutdown_tx).await?;
            #[cfg(not(unix))]
            anyhow::bail!("Unix socket listener is not available on this platform; use tcp-http");
        }
        ListenerMode::TcpHttp => {
            let bind_address = wg_tunnel_common::format_host_port(
                &daemon_config.bind_host,
                daemon_config.bind_port,
            );
            serve_tcp_http(app, &bind_address, shutdown_tx).await?;
        }
    }

    if let Err(e) = monitor_task.await {
        debug!("Status monitor task ended abnormally: {}", e);
    }
    info!("Daemon shut down");
    Ok(())
}

/// Serve on Unix domain socket (local-only)
#[cfg(unix)]
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = config::socket_path()?;

    // Remove a stale socket left by an earlier run
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }

    if let Some(parent) = socket_path.parent() {
        permissions::ensure_directory_with_permissions(parent, daemon_config.group_access)?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    // Set socket permissions immediately after binding
    permissions::set_socket_permissions(&socket_path, daemon_config.group_access)?;

    info!("Daemon listening on Unix socket: {}", socket_path.display());
    info!("Daemon started successfully");

    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        // Close SSE streams and stop the monitor
        let _ = shutdown_broadcast.send(());
        // Stop accepting connections
        let _ = shutdown_signal_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // Clients dropping an event stream is normal
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on TCP with HTTP (loopback only, enforced by config validation)
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Daemon listening on TCP (HTTP): {}", bind_address);
    info!("Daemon started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown().await;
            let _ = shutdown_tx.send(());
        })
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}
