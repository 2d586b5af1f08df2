// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

//! Tunnel manager.
//!
//! The lifecycle surface the API layer calls into. Every name coming in from
//! outside is sanitized here, and every mutation of a tunnel goes through the
//! same per-name guard the engines use.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use wg_tunnel_common::tunnel_config::{self, name_from_source, tunnel_name};
use wg_tunnel_common::{Error, Result, TunnelEvent, TunnelSummary};
use zeroize::Zeroizing;

use crate::activation::ActivationEngine;
use crate::cascade::Transition;
use crate::deactivation::DeactivationEngine;
use crate::events::EventBus;
use crate::mechanism::MechanismSource;
use crate::monitor::StatusMonitor;
use crate::registry::TunnelRegistry;
use crate::store::SecureStore;

const EVENT_CAPACITY: usize = 100;

/// Paths and timings the manager is built from
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub reprobe_delay: Duration,
    pub poll_interval: Duration,
}

#[derive(Clone)]
pub struct TunnelManager {
    store: Arc<SecureStore>,
    registry: Arc<TunnelRegistry>,
    events: EventBus,
    monitor: Arc<StatusMonitor>,
    activation: Arc<ActivationEngine>,
    deactivation: Arc<DeactivationEngine>,
    poll_interval: Duration,
}

impl TunnelManager {
    pub fn new(settings: ManagerSettings, mechanisms: Arc<dyn MechanismSource>) -> Result<Self> {
        let store = Arc::new(SecureStore::open(&settings.data_dir)?);
        let registry = Arc::new(TunnelRegistry::new());
        let events = EventBus::new(EVENT_CAPACITY);
        let monitor = Arc::new(StatusMonitor::new(
            registry.clone(),
            mechanisms.clone(),
            events.clone(),
            settings.reprobe_delay,
        ));
        let activation = Arc::new(ActivationEngine::new(
            store.clone(),
            registry.clone(),
            mechanisms.clone(),
            monitor.clone(),
            events.clone(),
            settings.temp_dir,
        ));
        let deactivation = Arc::new(DeactivationEngine::new(
            store.clone(),
            registry.clone(),
            mechanisms,
            monitor.clone(),
            events.clone(),
        ));

        Ok(Self {
            store,
            registry,
            events,
            monitor,
            activation,
            deactivation,
            poll_interval: settings.poll_interval,
        })
    }

    /// Validate and store a configuration. The name comes from `source_name`
    /// with any `.conf` extension stripped. A status probe of the new tunnel
    /// follows in the background.
    pub fn import_config(&self, source_name: &str, text: &str) -> Result<String> {
        let name = name_from_source(source_name)?;
        tunnel_config::validate(text)?;

        let guard = self.registry.begin(&name)?;
        self.store.put(&name, text)?;
        drop(guard);
        info!("Imported tunnel configuration {}", name);

        self.probe_in_background(name.clone());
        Ok(name)
    }

    /// Import the configuration file at `path`.
    pub fn import_file(&self, path: &Path) -> Result<String> {
        let text = Zeroizing::new(std::fs::read_to_string(path)?);
        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.import_config(&source_name, &text)
    }

    /// Decrypted configuration text, as imported.
    pub fn export_config(&self, name: &str) -> Result<Zeroizing<String>> {
        let name = tunnel_name(name)?;
        self.store.get(&name)
    }

    /// Every stored tunnel with its last observed state.
    pub fn list_configs(&self) -> Result<Vec<TunnelSummary>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|name| {
                let active = self.registry.known_state(&name).unwrap_or(false);
                TunnelSummary { name, active }
            })
            .collect())
    }

    pub async fn activate(&self, name: &str) -> Result<Transition> {
        let name = self.stored_name(name)?;
        self.activation.activate(&name).await
    }

    pub async fn deactivate(&self, name: &str) -> Result<Transition> {
        let name = self.stored_name(name)?;
        self.deactivation.deactivate(&name).await
    }

    /// Start probes for `name`, or for every stored tunnel. Results arrive as
    /// events.
    pub fn check_status(&self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => {
                let name = self.stored_name(name)?;
                self.probe_in_background(name);
            }
            None => {
                let names = self.store.list()?;
                debug!("Checking status of {} tunnels", names.len());
                let monitor = self.monitor.clone();
                tokio::spawn(async move { monitor.probe_all(&names).await });
            }
        }
        Ok(())
    }

    /// Delete a stored configuration. The backend is not touched.
    pub fn remove_config(&self, name: &str) -> Result<()> {
        let name = self.stored_name(name)?;
        let guard = self.registry.begin(&name)?;
        self.store.delete(&name)?;
        self.registry.forget(&name, guard);
        info!("Removed tunnel configuration {}", name);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub fn warn_privileges(&self, message: String) {
        self.events.set_privilege_warning(message);
    }

    pub fn privilege_warning(&self) -> Option<String> {
        self.events.privilege_warning()
    }

    /// Run the periodic status sweep until `shutdown` fires.
    pub fn spawn_monitor(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let store = self.store.clone();
        tokio::spawn(monitor.run(store, self.poll_interval, shutdown))
    }

    /// Sanitized name of a tunnel that has a stored configuration
    fn stored_name(&self, name: &str) -> Result<String> {
        let name = tunnel_name(name)?;
        if !self.store.contains(&name) {
            return Err(Error::ConfigNotFound(name));
        }
        Ok(name)
    }

    fn probe_in_background(&self, name: String) {
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            monitor.probe_one(&name).await;
        });
    }
}
