// Common types for WG Tunnel Manager

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A way of driving the platform's tunnel backend.
///
/// Variants are declared in cascade priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    /// The dedicated tunnel executable (`wireguard` on Windows)
    PrimaryExecutable,
    /// The OS service controller
    ServiceControl,
    /// The command-line quick-up script (`wg-quick`)
    QuickScript,
    /// Generic network adapter control; can only bring interfaces up
    PlatformAdapter,
}

impl MechanismKind {
    pub const CASCADE: [MechanismKind; 4] = [
        MechanismKind::PrimaryExecutable,
        MechanismKind::ServiceControl,
        MechanismKind::QuickScript,
        MechanismKind::PlatformAdapter,
    ];

    /// Whether this mechanism participates in deactivation.
    pub fn can_deactivate(&self) -> bool {
        !matches!(self, MechanismKind::PlatformAdapter)
    }

    pub fn label(&self) -> &'static str {
        match self {
            MechanismKind::PrimaryExecutable => "primary executable",
            MechanismKind::ServiceControl => "service control",
            MechanismKind::QuickScript => "quick script",
            MechanismKind::PlatformAdapter => "platform adapter",
        }
    }
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A stored tunnel as reported by `list`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSummary {
    pub name: String,
    /// Last observed state; `false` until a probe says otherwise
    pub active: bool,
}

/// Events emitted by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Observed or optimistic state change, or the outcome of a failed attempt
    TunnelStatus {
        name: String,
        active: bool,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// The daemon runs without the rights the backend needs
    PrivilegeWarning {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Keep-alive on the event stream
    Heartbeat { timestamp: DateTime<Utc> },
}

impl TunnelEvent {
    pub fn status(name: &str, active: bool) -> Self {
        TunnelEvent::TunnelStatus {
            name: name.to_string(),
            active,
            success: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(name: &str, active: bool, error: impl Into<String>) -> Self {
        TunnelEvent::TunnelStatus {
            name: name.to_string(),
            active,
            success: false,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn privilege_warning(message: impl Into<String>) -> Self {
        TunnelEvent::PrivilegeWarning {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Tunnel this event refers to, if any
    pub fn tunnel_name(&self) -> Option<&str> {
        match self {
            TunnelEvent::TunnelStatus { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Body of `POST /api/tunnels`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    /// File name (or bare name) the configuration came from
    pub source_name: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Outcome of an activate/deactivate request.
///
/// `pending` means the transition was reported optimistically and a
/// confirming probe is scheduled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LifecycleResult {
    pub success: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<MechanismKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl LifecycleResult {
    pub fn succeeded(mechanism: Option<MechanismKind>, pending: bool) -> Self {
        Self {
            success: true,
            pending,
            mechanism,
            error: None,
            code: None,
        }
    }

    pub fn failed(error: &Error) -> Self {
        Self {
            success: false,
            pending: false,
            mechanism: None,
            error: Some(error.to_string()),
            code: Some(error.code().to_string()),
        }
    }
}

/// Acknowledgement of an asynchronous status check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheck {
    pub checking: bool,
}
