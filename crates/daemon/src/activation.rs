// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

//! Activation engine.
//!
//! Decrypts the stored configuration, writes it to a short-lived file, and
//! walks the mechanism cascade until one brings the tunnel up. The file is
//! removed whatever the outcome, including when the attempt panics.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use wg_tunnel_common::tunnel_config;
use wg_tunnel_common::{Error, MechanismKind, Result};
use zeroize::Zeroizing;

use crate::cascade::{CascadeReport, Transition};
use crate::events::EventBus;
use crate::mechanism::MechanismSource;
use crate::monitor::StatusMonitor;
use crate::registry::TunnelRegistry;
use crate::store::SecureStore;

/// Per-activation configuration file, deleted on close or drop
pub struct TempConfigFile {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl TempConfigFile {
    /// Create `<name>-<millis>-<random>.conf` in `dir` holding `contents`.
    pub fn create(dir: &Path, name: &str, contents: &str) -> Result<Self> {
        let fs_error = |e: std::io::Error| Error::FileSystem(format!("temporary config: {}", e));

        fs::create_dir_all(dir).map_err(fs_error)?;
        let prefix = format!("{}-{}-", name, Utc::now().timestamp_millis());
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".conf")
            .rand_bytes(6)
            .tempfile_in(dir)
            .map_err(fs_error)?;

        file.write_all(contents.as_bytes()).map_err(fs_error)?;
        file.as_file().sync_all().map_err(fs_error)?;

        let path = file.path().to_path_buf();
        debug!("Wrote temporary config {}", path.display());
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete now. Failures are logged, never raised.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(file) = self.file.take() {
            match file.close() {
                Ok(()) => debug!("Removed temporary config {}", self.path.display()),
                Err(e) => warn!(
                    "Failed to remove temporary config {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

impl Drop for TempConfigFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Log record of one activation
#[derive(Debug)]
pub struct ActivationAttempt {
    pub tunnel_name: String,
    pub temp_file_path: PathBuf,
    pub mechanisms_tried: Vec<MechanismKind>,
    pub succeeded_with: Option<MechanismKind>,
}

pub struct ActivationEngine {
    store: Arc<SecureStore>,
    registry: Arc<TunnelRegistry>,
    mechanisms: Arc<dyn MechanismSource>,
    monitor: Arc<StatusMonitor>,
    events: EventBus,
    temp_dir: PathBuf,
}

impl ActivationEngine {
    pub fn new(
        store: Arc<SecureStore>,
        registry: Arc<TunnelRegistry>,
        mechanisms: Arc<dyn MechanismSource>,
        monitor: Arc<StatusMonitor>,
        events: EventBus,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            mechanisms,
            monitor,
            events,
            temp_dir,
        }
    }

    /// Bring `name` up. Returns as soon as a mechanism reports success; the
    /// backend's real state is confirmed by a delayed probe.
    pub async fn activate(&self, name: &str) -> Result<Transition> {
        let guard = self.registry.begin(name)?;
        info!("Activating tunnel {}", name);

        match self.attempt(name).await {
            Ok(kind) => {
                guard.set_active(true);
                self.events.status(name, true);
                self.monitor
                    .schedule_reprobe(name, guard.generation(), true);
                Ok(Transition {
                    mechanism: Some(kind),
                    pending: true,
                })
            }
            Err(e) => {
                error!("Activation of {} failed: {}", name, e);
                let active = guard.known_state().unwrap_or(false);
                self.events.failure(name, active, e.to_string());
                Err(e)
            }
        }
    }

    async fn attempt(&self, name: &str) -> Result<MechanismKind> {
        let prepared = {
            let stored = self.store.get(name)?;
            Zeroizing::new(tunnel_config::prepare(&stored, name)?)
        };
        let config_file = TempConfigFile::create(&self.temp_dir, name, &prepared)?;
        drop(prepared);

        let mut attempt = ActivationAttempt {
            tunnel_name: name.to_string(),
            temp_file_path: config_file.path().to_path_buf(),
            mechanisms_tried: Vec::new(),
            succeeded_with: None,
        };

        let mechanisms = self.mechanisms.current().await;
        let mut report = CascadeReport::new("activate");
        for mechanism in mechanisms.activation_cascade() {
            let kind = mechanism.kind();
            attempt.mechanisms_tried.push(kind);
            match mechanism.activate(name, config_file.path()).await {
                Ok(()) => {
                    info!("Tunnel {} activated via {}", name, kind);
                    attempt.succeeded_with = Some(kind);
                    break;
                }
                Err(e) => {
                    warn!("{} could not activate {}: {}", kind, name, e);
                    report.record(kind, e);
                }
            }
        }

        config_file.close();
        debug!(
            tunnel = %attempt.tunnel_name,
            file = %attempt.temp_file_path.display(),
            tried = ?attempt.mechanisms_tried,
            "Activation attempt finished"
        );

        match attempt.succeeded_with {
            Some(kind) => Ok(kind),
            None => Err(report.into_error(name)),
        }
    }
}
