// Shared fixtures for daemon unit tests

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::BackendConfig;
use crate::discovery::{ExecutableLocation, ResolvedTools};
use crate::manager::{ManagerSettings, TunnelManager};
use crate::mechanism::MechanismSet;
use crate::process::{CommandOutput, CommandRunner};
use crate::store::SecureStore;

pub const SAMPLE_CONFIG: &str = "[Interface]\n\
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
Address = 10.0.0.2/32\n\
\n\
[Peer]\n\
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
Endpoint = vpn.example.com:51820\n\
AllowedIPs = 0.0.0.0/0\n";

#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    /// Spawn fails with `NotFound`
    Missing,
    Delayed(Duration, CommandOutput),
    Panic,
}

#[derive(Default)]
struct RunnerState {
    defaults: HashMap<String, Reply>,
    queued: HashMap<String, VecDeque<Reply>>,
    calls: Vec<(String, Vec<String>)>,
    config_files: Vec<PathBuf>,
    config_contents: Vec<String>,
}

/// Scripted stand-in for the host. Unscripted programs are missing.
#[derive(Default)]
pub struct ScriptedRunner {
    state: Mutex<RunnerState>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every call to `program` with `reply`
    pub fn respond(&self, program: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .defaults
            .insert(program.to_string(), reply);
    }

    /// Answer the next call to `program` with `reply`, ahead of the default
    pub fn queue(&self, program: &str, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .queued
            .entry(program.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn exit(code: i32, stdout: &str, stderr: &str) -> Reply {
        Reply::Output(CommandOutput {
            code: Some(code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
    }

    pub fn delayed_exit(millis: u64, code: i32) -> Reply {
        Reply::Delayed(
            Duration::from_millis(millis),
            CommandOutput {
                code: Some(code),
                ..Default::default()
            },
        )
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|(program, _)| program).collect()
    }

    /// Every argument that named an existing file when the call was made
    pub fn seen_config_files(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().config_files.clone()
    }

    pub fn seen_config_contents(&self) -> Vec<String> {
        self.state.lock().unwrap().config_contents.clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((program.to_string(), args.to_vec()));
            for arg in args {
                let path = PathBuf::from(arg);
                if path.is_file() {
                    if let Ok(contents) = std::fs::read_to_string(&path) {
                        state.config_contents.push(contents);
                    }
                    state.config_files.push(path);
                }
            }
            let queued = state
                .queued
                .get_mut(program)
                .and_then(|replies| replies.pop_front());
            queued
                .or_else(|| state.defaults.get(program).cloned())
                .unwrap_or(Reply::Missing)
        };

        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Missing => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", program),
            )),
            Reply::Delayed(delay, output) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
            Reply::Panic => panic!("scripted panic in {}", program),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn test_backend() -> BackendConfig {
    BackendConfig {
        primary_executable: "wireguard".to_string(),
        well_known_dirs: Vec::new(),
        sibling_tools: strings(&["wg", "wg-quick"]),
        primary_activate_args: strings(&["/installtunnelservice", "{config}"]),
        primary_deactivate_args: strings(&["/uninstalltunnelservice", "{name}"]),
        primary_status_args: strings(&["/tunnelstatus", "{name}"]),
        primary_running_marker: "Running".to_string(),
        service_program: "svc".to_string(),
        service_start_args: strings(&["start", "WireGuardTunnel${name}"]),
        service_stop_args: strings(&["stop", "WireGuardTunnel${name}"]),
        service_query_args: strings(&["query", "WireGuardTunnel${name}"]),
        service_running_marker: "RUNNING".to_string(),
        service_missing_exit_codes: vec![1060],
        quick_script: "wg-quick".to_string(),
        quick_up_args: strings(&["up", "{config}"]),
        quick_down_args: strings(&["down", "{name}"]),
        show_tool: "wg".to_string(),
        show_args: strings(&["show", "{name}"]),
        adapter_program: "adapter".to_string(),
        adapter_up_args: strings(&["set", "{name}", "up"]),
        interface_list_program: "iflist".to_string(),
        interface_list_args: strings(&["show"]),
    }
}

pub fn test_tools(primary_found: bool) -> ResolvedTools {
    ResolvedTools {
        primary: if primary_found {
            ExecutableLocation::Found(PathBuf::from("wireguard"))
        } else {
            ExecutableLocation::BareName("wireguard".to_string())
        },
        service_program: "svc".to_string(),
        quick_script: "wg-quick".to_string(),
        show_tool: "wg".to_string(),
        adapter_program: "adapter".to_string(),
        interface_list_program: "iflist".to_string(),
    }
}

/// A manager wired to a scripted runner and throwaway directories
pub struct Harness {
    pub runner: Arc<ScriptedRunner>,
    pub manager: TunnelManager,
    dirs: TempDir,
}

impl Harness {
    /// Store a config directly, without the probe an import would start
    pub fn seed(&self, name: &str, text: &str) {
        self.store().put(name, text).unwrap();
    }

    pub fn store(&self) -> SecureStore {
        SecureStore::open(&self.data_dir()).unwrap()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dirs.path().join("data")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dirs.path().join("tmp")
    }
}

pub async fn harness(primary_found: bool) -> Harness {
    let dirs = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let mechanisms = MechanismSet::from_tools(
        &test_tools(primary_found),
        &test_backend(),
        runner.clone(),
    );
    let settings = ManagerSettings {
        data_dir: dirs.path().join("data"),
        temp_dir: dirs.path().join("tmp"),
        reprobe_delay: Duration::from_millis(250),
        poll_interval: Duration::from_secs(3600),
    };
    let manager = TunnelManager::new(settings, Arc::new(mechanisms)).unwrap();
    std::fs::create_dir_all(dirs.path().join("tmp")).unwrap();

    Harness {
        runner,
        manager,
        dirs,
    }
}
