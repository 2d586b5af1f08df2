// WG Tunnel Manager - Status Monitor
// Periodic and on-demand probes that keep recorded state in line with the backend

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::mechanism::MechanismSource;
use crate::registry::{Observation, TunnelRegistry};
use crate::store::SecureStore;

pub struct StatusMonitor {
    registry: Arc<TunnelRegistry>,
    mechanisms: Arc<dyn MechanismSource>,
    events: EventBus,
    reprobe_delay: Duration,
}

impl StatusMonitor {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        mechanisms: Arc<dyn MechanismSource>,
        events: EventBus,
        reprobe_delay: Duration,
    ) -> Self {
        Self {
            registry,
            mechanisms,
            events,
            reprobe_delay,
        }
    }

    /// Ask the backend. A failed probe reads as inactive.
    async fn probe_backend(&self, name: &str) -> bool {
        let mechanisms = self.mechanisms.current().await;
        match mechanisms.probe(name).await {
            Ok(active) => active,
            Err(e) => {
                debug!("Status probe for {} failed, treating as inactive: {}", name, e);
                false
            }
        }
    }

    /// Probe one tunnel and publish a status event if its state changed.
    pub async fn probe_one(&self, name: &str) -> Observation {
        if self.registry.is_busy(name) {
            debug!("Skipping probe of {}: operation in flight", name);
            return Observation::Discarded;
        }
        let generation = self.registry.generation(name);
        let active = self.probe_backend(name).await;

        let observation = self.registry.observe(name, generation, active);
        match observation {
            Observation::Changed { previous } => {
                info!(
                    "Tunnel {} is now {} (was {:?})",
                    name,
                    if active { "active" } else { "inactive" },
                    previous
                );
                self.events.status(name, active);
            }
            Observation::Discarded | Observation::Stale => {
                debug!("Dropped probe result for {}: {:?}", name, observation)
            }
            Observation::Unchanged => {}
        }
        observation
    }

    /// Probe every name concurrently.
    pub async fn probe_all(&self, names: &[String]) {
        join_all(names.iter().map(|name| self.probe_one(name))).await;
    }

    /// After a transition, re-probe once the backend has had time to settle.
    /// The probe is cancelled if another transition on `name` starts first.
    pub fn schedule_reprobe(self: &Arc<Self>, name: &str, generation: u64, expected: bool) {
        let monitor = Arc::clone(self);
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(monitor.reprobe_delay).await;
            monitor.confirm(&task_name, generation, expected).await;
        });
        self.registry
            .set_reprobe(name, generation, handle.abort_handle());
    }

    async fn confirm(&self, name: &str, generation: u64, expected: bool) {
        let active = self.probe_backend(name).await;
        match self.registry.observe(name, generation, active) {
            Observation::Changed { .. } if active == expected => {
                self.events.status(name, active);
            }
            Observation::Changed { .. } => {
                let verb = if expected { "activation" } else { "deactivation" };
                warn!("Backend did not confirm {} of {}", verb, name);
                self.events.failure(
                    name,
                    active,
                    format!(
                        "{} reported success but the tunnel is {}",
                        verb,
                        if active { "still active" } else { "not active" }
                    ),
                );
            }
            Observation::Unchanged => debug!("Confirmed {} is {}", name, active),
            other => debug!("Dropped confirming probe for {}: {:?}", name, other),
        }
    }

    /// Sweep every stored tunnel at `interval`, starting immediately.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<SecureStore>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Status monitor running every {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.list() {
                        Ok(names) => self.probe_all(&names).await,
                        Err(e) => warn!("Status sweep could not list tunnels: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Status monitor stopping");
                    break;
                }
            }
        }
    }
}
