// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

//! Backend mechanisms and the cascade they form.
//!
//! Each mechanism wraps one way of driving the platform's tunnel backend.
//! Engines try them in [`MechanismKind`] order; the first success wins.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use wg_tunnel_common::MechanismKind;

use crate::config::BackendConfig;
use crate::discovery::{ExecutableLocation, MechanismDiscovery, ResolvedTools};
use crate::process::{expand_args, CommandOutput, CommandRunner};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MechanismError {
    /// The mechanism is not present on this host
    #[error("{0}")]
    Unavailable(String),

    #[error("operation not supported")]
    Unsupported,

    /// The mechanism ran and reported failure
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Mechanism: Send + Sync {
    fn kind(&self) -> MechanismKind;

    /// Whether discovery located this mechanism's program
    fn is_available(&self) -> bool {
        true
    }

    async fn activate(&self, name: &str, config_path: &Path) -> Result<(), MechanismError>;

    async fn deactivate(&self, name: &str) -> Result<(), MechanismError>;

    /// `Ok(true)` when the backend reports the tunnel running
    async fn probe(&self, name: &str) -> Result<bool, MechanismError>;
}

async fn invoke(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<CommandOutput, MechanismError> {
    debug!("Invoking {} {:?}", program, args);
    match runner.run(program, args).await {
        Ok(output) => Ok(output),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(MechanismError::Unavailable(format!("{} not found", program)))
        }
        Err(e) => Err(MechanismError::Failed(format!(
            "could not launch {}: {}",
            program, e
        ))),
    }
}

fn require_success(program: &str, output: &CommandOutput) -> Result<(), MechanismError> {
    if output.success() {
        Ok(())
    } else {
        Err(MechanismError::Failed(format!("{} {}", program, output.summary())))
    }
}

/// The dedicated tunnel executable
pub struct PrimaryExecutable {
    runner: Arc<dyn CommandRunner>,
    location: ExecutableLocation,
    activate_args: Vec<String>,
    deactivate_args: Vec<String>,
    status_args: Vec<String>,
    running_marker: String,
}

impl PrimaryExecutable {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        location: ExecutableLocation,
        backend: &BackendConfig,
    ) -> Self {
        Self {
            runner,
            location,
            activate_args: backend.primary_activate_args.clone(),
            deactivate_args: backend.primary_deactivate_args.clone(),
            status_args: backend.primary_status_args.clone(),
            running_marker: backend.primary_running_marker.clone(),
        }
    }
}

#[async_trait]
impl Mechanism for PrimaryExecutable {
    fn kind(&self) -> MechanismKind {
        MechanismKind::PrimaryExecutable
    }

    fn is_available(&self) -> bool {
        self.location.is_found()
    }

    async fn activate(&self, name: &str, config_path: &Path) -> Result<(), MechanismError> {
        let program = self.location.program();
        let args = expand_args(&self.activate_args, name, Some(config_path));
        let output = invoke(self.runner.as_ref(), &program, &args).await?;
        require_success(&program, &output)
    }

    async fn deactivate(&self, name: &str) -> Result<(), MechanismError> {
        let program = self.location.program();
        let args = expand_args(&self.deactivate_args, name, None);
        let output = invoke(self.runner.as_ref(), &program, &args).await?;
        require_success(&program, &output)
    }

    async fn probe(&self, name: &str) -> Result<bool, MechanismError> {
        let program = self.location.program();
        let args = expand_args(&self.status_args, name, None);
        let output = invoke(self.runner.as_ref(), &program, &args).await?;
        Ok(output.success() && output.stdout_has_token(&self.running_marker))
    }
}

/// The OS service controller
pub struct ServiceControl {
    runner: Arc<dyn CommandRunner>,
    program: String,
    start_args: Vec<String>,
    stop_args: Vec<String>,
    query_args: Vec<String>,
    running_marker: String,
    missing_exit_codes: Vec<i32>,
}

impl ServiceControl {
    pub fn new(runner: Arc<dyn CommandRunner>, program: String, backend: &BackendConfig) -> Self {
        Self {
            runner,
            program,
            start_args: backend.service_start_args.clone(),
            stop_args: backend.service_stop_args.clone(),
            query_args: backend.service_query_args.clone(),
            running_marker: backend.service_running_marker.clone(),
            missing_exit_codes: backend.service_missing_exit_codes.clone(),
        }
    }

    fn service_missing(&self, output: &CommandOutput) -> bool {
        output
            .code
            .map(|code| self.missing_exit_codes.contains(&code))
            .unwrap_or(false)
    }

    async fn control(&self, name: &str, template: &[String]) -> Result<(), MechanismError> {
        let args = expand_args(template, name, None);
        let output = invoke(self.runner.as_ref(), &self.program, &args).await?;
        if self.service_missing(&output) {
            return Err(MechanismError::Unavailable(format!(
                "no service installed for {} ({})",
                name,
                output.summary()
            )));
        }
        require_success(&self.program, &output)
    }
}

#[async_trait]
impl Mechanism for ServiceControl {
    fn kind(&self) -> MechanismKind {
        MechanismKind::ServiceControl
    }

    async fn activate(&self, name: &str, _config_path: &Path) -> Result<(), MechanismError> {
        self.control(name, &self.start_args).await
    }

    async fn deactivate(&self, name: &str) -> Result<(), MechanismError> {
        self.control(name, &self.stop_args).await
    }

    async fn probe(&self, name: &str) -> Result<bool, MechanismError> {
        let args = expand_args(&self.query_args, name, None);
        let output = invoke(self.runner.as_ref(), &self.program, &args).await?;
        if self.service_missing(&output) {
            return Ok(false);
        }
        Ok(output.stdout_has_token(&self.running_marker))
    }
}

/// The quick-up script, with the show tool for probing
pub struct QuickScript {
    runner: Arc<dyn CommandRunner>,
    program: String,
    up_args: Vec<String>,
    down_args: Vec<String>,
    show_program: String,
    show_args: Vec<String>,
}

impl QuickScript {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: String,
        show_program: String,
        backend: &BackendConfig,
    ) -> Self {
        Self {
            runner,
            program,
            up_args: backend.quick_up_args.clone(),
            down_args: backend.quick_down_args.clone(),
            show_program,
            show_args: backend.show_args.clone(),
        }
    }
}

#[async_trait]
impl Mechanism for QuickScript {
    fn kind(&self) -> MechanismKind {
        MechanismKind::QuickScript
    }

    async fn activate(&self, name: &str, config_path: &Path) -> Result<(), MechanismError> {
        let args = expand_args(&self.up_args, name, Some(config_path));
        let output = invoke(self.runner.as_ref(), &self.program, &args).await?;
        require_success(&self.program, &output)
    }

    async fn deactivate(&self, name: &str) -> Result<(), MechanismError> {
        let args = expand_args(&self.down_args, name, None);
        let output = invoke(self.runner.as_ref(), &self.program, &args).await?;
        require_success(&self.program, &output)
    }

    async fn probe(&self, name: &str) -> Result<bool, MechanismError> {
        let args = expand_args(&self.show_args, name, None);
        let output = invoke(self.runner.as_ref(), &self.show_program, &args).await?;
        Ok(output.success())
    }
}

/// Generic adapter control. Brings interfaces up; cannot tear tunnels down.
pub struct PlatformAdapter {
    runner: Arc<dyn CommandRunner>,
    program: String,
    up_args: Vec<String>,
    list_program: String,
    list_args: Vec<String>,
}

impl PlatformAdapter {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: String,
        list_program: String,
        backend: &BackendConfig,
    ) -> Self {
        Self {
            runner,
            program,
            up_args: backend.adapter_up_args.clone(),
            list_program,
            list_args: backend.interface_list_args.clone(),
        }
    }
}

#[async_trait]
impl Mechanism for PlatformAdapter {
    fn kind(&self) -> MechanismKind {
        MechanismKind::PlatformAdapter
    }

    async fn activate(&self, name: &str, _config_path: &Path) -> Result<(), MechanismError> {
        let args = expand_args(&self.up_args, name, None);
        let output = invoke(self.runner.as_ref(), &self.program, &args).await?;
        require_success(&self.program, &output)
    }

    async fn deactivate(&self, _name: &str) -> Result<(), MechanismError> {
        Err(MechanismError::Unsupported)
    }

    /// Whether the interface listing mentions the tunnel
    async fn probe(&self, name: &str) -> Result<bool, MechanismError> {
        let args = expand_args(&self.list_args, name, None);
        let output = invoke(self.runner.as_ref(), &self.list_program, &args).await?;
        require_success(&self.list_program, &output)?;
        Ok(output.stdout_has_token(name))
    }
}

/// Mechanisms in cascade order
#[derive(Clone)]
pub struct MechanismSet {
    cascade: Vec<Arc<dyn Mechanism>>,
}

impl MechanismSet {
    pub fn new(mut mechanisms: Vec<Arc<dyn Mechanism>>) -> Self {
        mechanisms.sort_by_key(|m| m.kind());
        Self {
            cascade: mechanisms,
        }
    }

    pub fn from_tools(
        tools: &ResolvedTools,
        backend: &BackendConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::new(vec![
            Arc::new(PrimaryExecutable::new(
                runner.clone(),
                tools.primary.clone(),
                backend,
            )),
            Arc::new(ServiceControl::new(
                runner.clone(),
                tools.service_program.clone(),
                backend,
            )),
            Arc::new(QuickScript::new(
                runner.clone(),
                tools.quick_script.clone(),
                tools.show_tool.clone(),
                backend,
            )),
            Arc::new(PlatformAdapter::new(
                runner,
                tools.adapter_program.clone(),
                tools.interface_list_program.clone(),
                backend,
            )),
        ])
    }

    fn get(&self, kind: MechanismKind) -> Option<&Arc<dyn Mechanism>> {
        self.cascade.iter().find(|m| m.kind() == kind)
    }

    pub fn activation_cascade(&self) -> impl Iterator<Item = &Arc<dyn Mechanism>> {
        self.cascade.iter()
    }

    pub fn deactivation_cascade(&self) -> impl Iterator<Item = &Arc<dyn Mechanism>> {
        self.cascade.iter().filter(|m| m.kind().can_deactivate())
    }

    /// The primary executable when discovery located it, otherwise the
    /// interface listing.
    pub fn status_probe(&self) -> Option<&Arc<dyn Mechanism>> {
        self.get(MechanismKind::PrimaryExecutable)
            .filter(|m| m.is_available())
            .or_else(|| self.get(MechanismKind::PlatformAdapter))
    }

    pub async fn probe(&self, name: &str) -> Result<bool, MechanismError> {
        match self.status_probe() {
            Some(mechanism) => mechanism.probe(name).await,
            None => Err(MechanismError::Unavailable(
                "no status mechanism configured".to_string(),
            )),
        }
    }

    pub fn primary_located(&self) -> bool {
        self.get(MechanismKind::PrimaryExecutable)
            .map(|m| m.is_available())
            .unwrap_or(false)
    }
}

/// Supplies the mechanism set engines and the monitor should use right now
#[async_trait]
pub trait MechanismSource: Send + Sync {
    async fn current(&self) -> Arc<MechanismSet>;
}

/// A set that never changes
#[async_trait]
impl MechanismSource for MechanismSet {
    async fn current(&self) -> Arc<MechanismSet> {
        Arc::new(self.clone())
    }
}

/// Discovered on first use and cached. While the primary executable is
/// still unlocated, every request re-runs discovery so a later install is
/// picked up.
pub struct DiscoveredMechanisms {
    discovery: MechanismDiscovery,
    backend: BackendConfig,
    runner: Arc<dyn CommandRunner>,
    cached: RwLock<Option<Arc<MechanismSet>>>,
}

impl DiscoveredMechanisms {
    pub fn new(
        discovery: MechanismDiscovery,
        backend: BackendConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            discovery,
            backend,
            runner,
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl MechanismSource for DiscoveredMechanisms {
    async fn current(&self) -> Arc<MechanismSet> {
        if let Some(set) = self.cached.read().await.as_ref() {
            if set.primary_located() {
                return set.clone();
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(set) = cached.as_ref() {
            if set.primary_located() {
                return set.clone();
            }
        }

        let tools = self.discovery.resolve(&self.backend);
        match &tools.primary {
            ExecutableLocation::Found(path) => {
                info!("Primary tunnel executable: {}", path.display())
            }
            ExecutableLocation::BareName(name) => {
                debug!("Primary tunnel executable not located; using bare name {}", name)
            }
        }

        let set = Arc::new(MechanismSet::from_tools(
            &tools,
            &self.backend,
            self.runner.clone(),
        ));
        *cached = Some(set.clone());
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_backend, test_tools, ScriptedRunner};
    use std::path::PathBuf;

    fn set_with(runner: Arc<ScriptedRunner>, primary_found: bool) -> MechanismSet {
        MechanismSet::from_tools(&test_tools(primary_found), &test_backend(), runner)
    }

    #[test]
    fn test_cascade_order_is_fixed() {
        let runner = ScriptedRunner::new();
        let set = set_with(runner, true);
        let activation: Vec<_> = set.activation_cascade().map(|m| m.kind()).collect();
        assert_eq!(activation, MechanismKind::CASCADE.to_vec());

        let deactivation: Vec<_> = set.deactivation_cascade().map(|m| m.kind()).collect();
        assert_eq!(
            deactivation,
            vec![
                MechanismKind::PrimaryExecutable,
                MechanismKind::ServiceControl,
                MechanismKind::QuickScript
            ]
        );
    }

    #[test]
    fn test_status_probe_selection() {
        let runner = ScriptedRunner::new();
        let located = set_with(runner.clone(), true);
        assert_eq!(
            located.status_probe().map(|m| m.kind()),
            Some(MechanismKind::PrimaryExecutable)
        );

        let missing = set_with(runner, false);
        assert_eq!(
            missing.status_probe().map(|m| m.kind()),
            Some(MechanismKind::PlatformAdapter)
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let runner = ScriptedRunner::new();
        let set = set_with(runner, false);
        let primary = set.activation_cascade().next().unwrap();
        let err = primary
            .activate("office", &PathBuf::from("/tmp/office.conf"))
            .await
            .unwrap_err();
        assert!(matches!(err, MechanismError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_service_missing_exit_code_is_unavailable() {
        let runner = ScriptedRunner::new();
        runner.respond("svc", ScriptedRunner::exit(1060, "", "service does not exist"));
        let set = set_with(runner, true);
        let service = set.activation_cascade().nth(1).unwrap();
        assert_eq!(service.kind(), MechanismKind::ServiceControl);

        let err = service.deactivate("office").await.unwrap_err();
        assert!(matches!(err, MechanismError::Unavailable(_)));
        assert!(!service.probe("office").await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_markers() {
        let runner = ScriptedRunner::new();
        runner.respond("wireguard", ScriptedRunner::exit(0, "Tunnel office: Running\n", ""));
        runner.respond("iflist", ScriptedRunner::exit(0, "Enabled Connected Dedicated office\n", ""));
        let located = set_with(runner.clone(), true);
        assert!(located.probe("office").await.unwrap());

        let via_adapter = set_with(runner, false);
        assert!(via_adapter.probe("office").await.unwrap());
        assert!(!via_adapter.probe("home").await.unwrap());
    }

    #[tokio::test]
    async fn test_adapter_cannot_deactivate() {
        let runner = ScriptedRunner::new();
        let set = set_with(runner.clone(), true);
        let adapter = set.activation_cascade().last().unwrap();
        assert_eq!(
            adapter.deactivate("office").await,
            Err(MechanismError::Unsupported)
        );
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_command_carries_summary() {
        let runner = ScriptedRunner::new();
        runner.respond("wg-quick", ScriptedRunner::exit(1, "", "RTNETLINK answers: Operation not permitted"));
        let set = set_with(runner.clone(), true);
        let quick = set.activation_cascade().nth(2).unwrap();

        let err = quick
            .activate("office", &PathBuf::from("/tmp/office-1.conf"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MechanismError::Failed(
                "wg-quick exit 1: RTNETLINK answers: Operation not permitted".to_string()
            )
        );
        let (program, args) = runner.calls().pop().unwrap();
        assert_eq!(program, "wg-quick");
        assert!(args.contains(&"/tmp/office-1.conf".to_string()));
    }
}
