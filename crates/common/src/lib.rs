// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

// WG Tunnel Manager - Common Library
// Shared types, tunnel configuration helpers, and the daemon client

pub mod daemon_client;
pub mod error;
pub mod network;
pub mod sse;
pub mod tunnel_config;
pub mod types;

pub use daemon_client::{
    activate_tunnel, add_auth_header, check_status, create_daemon_client, create_event_client,
    deactivate_tunnel, export_config, import_config, list_tunnels, remove_config,
    run_transition_with_events, ConnectionMode, DaemonClientConfig, LifecycleAction,
    TransitionHandler, TransitionOutcome, AUTH_HEADER,
};
pub use error::{Error, Result};
pub use network::{format_host_port, is_loopback_address};
pub use sse::EventListener;
pub use types::{
    ExportResult, ImportRequest, ImportResult, LifecycleResult, MechanismKind, StatusCheck,
    TunnelEvent, TunnelSummary,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
