// WG Tunnel Manager - Cascade bookkeeping shared by both engines

use wg_tunnel_common::{Error, MechanismKind};

use crate::mechanism::MechanismError;

/// Result of a successful transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// `None` when nothing had to be invoked
    pub mechanism: Option<MechanismKind>,
    /// A confirming probe is scheduled
    pub pending: bool,
}

/// Failures collected while walking the cascade
#[derive(Debug)]
pub struct CascadeReport {
    action: &'static str,
    failures: Vec<(MechanismKind, MechanismError)>,
}

impl CascadeReport {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, kind: MechanismKind, error: MechanismError) {
        self.failures.push((kind, error));
    }

    /// `"primary executable: wireguard not found; service control: ..."`
    pub fn diagnostics(&self) -> String {
        if self.failures.is_empty() {
            return "no mechanisms configured".to_string();
        }
        self.failures
            .iter()
            .map(|(kind, error)| format!("{}: {}", kind, error))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// `MechanismNotFound` when nothing could even be attempted, otherwise
    /// `ExternalProcess`.
    pub fn into_error(self, name: &str) -> Error {
        let nothing_ran = self.failures.iter().all(|(_, e)| {
            matches!(e, MechanismError::Unavailable(_) | MechanismError::Unsupported)
        });
        let diagnostics = self.diagnostics();
        if nothing_ran {
            Error::MechanismNotFound {
                name: name.to_string(),
                action: self.action.to_string(),
                diagnostics,
            }
        } else {
            Error::ExternalProcess {
                name: name.to_string(),
                action: self.action.to_string(),
                diagnostics,
            }
        }
    }
}
