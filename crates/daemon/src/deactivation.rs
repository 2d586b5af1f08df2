// WG Tunnel Manager - Deactivation Engine
// Probes first, then walks the teardown cascade

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use wg_tunnel_common::{Error, MechanismKind, Result};

use crate::cascade::{CascadeReport, Transition};
use crate::events::EventBus;
use crate::mechanism::{MechanismSet, MechanismSource};
use crate::monitor::StatusMonitor;
use crate::registry::{OperationGuard, TunnelRegistry};
use crate::store::SecureStore;

pub struct DeactivationEngine {
    store: Arc<SecureStore>,
    registry: Arc<TunnelRegistry>,
    mechanisms: Arc<dyn MechanismSource>,
    monitor: Arc<StatusMonitor>,
    events: EventBus,
}

impl DeactivationEngine {
    pub fn new(
        store: Arc<SecureStore>,
        registry: Arc<TunnelRegistry>,
        mechanisms: Arc<dyn MechanismSource>,
        monitor: Arc<StatusMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            registry,
            mechanisms,
            monitor,
            events,
        }
    }

    /// Take `name` down.
    ///
    /// A tunnel the backend already reports inactive is left alone and the
    /// result is not pending. The platform adapter is never used here.
    pub async fn deactivate(&self, name: &str) -> Result<Transition> {
        let guard = self.registry.begin(name)?;
        if !self.store.contains(name) {
            return Err(Error::ConfigNotFound(name.to_string()));
        }
        info!("Deactivating tunnel {}", name);

        let mechanisms = self.mechanisms.current().await;
        match mechanisms.probe(name).await {
            Ok(false) => {
                debug!("Tunnel {} is already inactive", name);
                if guard.set_active(false) {
                    self.events.status(name, false);
                }
                return Ok(Transition {
                    mechanism: None,
                    pending: false,
                });
            }
            Ok(true) => {}
            Err(e) => debug!("Pre-deactivation probe of {} failed: {}", name, e),
        }

        match self.teardown(&mechanisms, name).await {
            Ok(kind) => {
                guard.set_active(false);
                self.events.status(name, false);
                self.monitor
                    .schedule_reprobe(name, guard.generation(), false);
                Ok(Transition {
                    mechanism: Some(kind),
                    pending: true,
                })
            }
            Err(e) => {
                error!("Deactivation of {} failed: {}", name, e);
                self.report_failure(&guard, name, &e);
                Err(e)
            }
        }
    }

    async fn teardown(&self, mechanisms: &MechanismSet, name: &str) -> Result<MechanismKind> {
        let mut report = CascadeReport::new("deactivate");
        for mechanism in mechanisms.deactivation_cascade() {
            let kind = mechanism.kind();
            match mechanism.deactivate(name).await {
                Ok(()) => {
                    info!("Tunnel {} deactivated via {}", name, kind);
                    return Ok(kind);
                }
                Err(e) => {
                    warn!("{} could not deactivate {}: {}", kind, name, e);
                    report.record(kind, e);
                }
            }
        }
        Err(report.into_error(name))
    }

    fn report_failure(&self, guard: &OperationGuard, name: &str, e: &Error) {
        let active = guard.known_state().unwrap_or(true);
        self.events.failure(name, active, e.to_string());
    }
}
