//! In-memory container runtime for integration tests.
//!
//! Keeps networks, containers and images in maps and simulates the switch's
//! process table well enough for `lsof`, `kill` and forwarder launches.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socks_fleet::runtime::{
    BuildRequest, ContainerInfo, ContainerRuntime, ContainerSpec, ExecMode, ExecOutput,
    NetworkInfo, NetworkSpec, Result, RuntimeError,
};
use socks_fleet::{Fleet, FleetConfig};

/// One mutating or exec call, in the order the fake saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateNetwork(String),
    ConnectNetwork {
        network: String,
        container: String,
        aliases: Vec<String>,
        ipv4_address: Option<Ipv4Addr>,
    },
    DisconnectNetwork {
        network: String,
        container: String,
    },
    BuildImage {
        tag: String,
        dockerfile: String,
        context: PathBuf,
    },
    RemoveImage(String),
    RunContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    Exec {
        container: String,
        argv: Vec<String>,
        mode: ExecMode,
    },
}

/// A process running inside a fake container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub command: String,
    pub port: u16,
    /// `-P` upstream of a forwarder.
    pub target: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    /// network -> aliases
    pub networks: BTreeMap<String, Vec<String>>,
    pub processes: Vec<Process>,
}

#[derive(Default)]
struct State {
    networks: BTreeMap<String, NetworkSpec>,
    containers: BTreeMap<String, Container>,
    images: BTreeSet<String>,
    calls: Vec<Call>,
    next_id: u32,
    next_pid: u32,
    /// Containers that come back right after being removed.
    respawn: BTreeSet<String>,
    /// Exit code every `lsof` reports instead of the simulated one.
    lsof_exit: Option<i64>,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn add_network(&self, name: &str) {
        let spec = NetworkSpec {
            name: name.to_string(),
            driver: "bridge".to_string(),
            subnet: String::new(),
            ip_range: String::new(),
            gateway: String::new(),
        };
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(name.to_string(), spec);
    }

    pub fn network(&self, name: &str) -> Option<NetworkSpec> {
        self.state.lock().unwrap().networks.get(name).cloned()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    /// Add a running container outside of `run_container`.
    pub fn add_container(&self, name: &str, labels: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let container = Container {
            id: format!("fake{}", state.next_id),
            spec: ContainerSpec {
                name: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
            running: true,
            networks: BTreeMap::new(),
            processes: Vec::new(),
        };
        state.containers.insert(name.to_string(), container);
    }

    pub fn container(&self, name: &str) -> Option<Container> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.running = running;
        }
    }

    /// Start a process inside `container` as if launched out of band.
    pub fn spawn_process(&self, container: &str, command: &str, port: u16, target: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.next_pid += 1;
        let pid = 100 + state.next_pid;
        let mut argv = vec![command.to_string()];
        if !target.is_empty() {
            argv.extend(["-P".to_string(), target.to_string()]);
        }
        if let Some(c) = state.containers.get_mut(container) {
            c.processes.push(Process {
                pid,
                command: command.to_string(),
                port,
                target: target.to_string(),
                argv,
            });
        }
        pid
    }

    pub fn processes(&self, container: &str) -> Vec<Process> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container)
            .map(|c| c.processes.clone())
            .unwrap_or_default()
    }

    pub fn respawn_on_remove(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .respawn
            .insert(name.to_string());
    }

    pub fn force_lsof_exit(&self, code: i64) {
        self.state.lock().unwrap().lsof_exit = Some(code);
    }

    pub fn add_image(&self, tag: &str) {
        self.state.lock().unwrap().images.insert(tag.to_string());
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.state.lock().unwrap().images.contains(tag)
    }

    pub fn run_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::RunContainer(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}

fn info(container: &Container) -> ContainerInfo {
    ContainerInfo {
        id: container.id.clone(),
        name: container.spec.name.clone(),
        running: container.running,
        labels: container.spec.labels.clone(),
    }
}

fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

fn lsof(processes: &[Process], argv: &[String]) -> ExecOutput {
    let command = flag_value(argv, "-c").unwrap_or_default();
    let port = argv
        .iter()
        .find_map(|a| a.strip_prefix("-iTCP"))
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|p| p.parse::<u16>().ok());

    let pids: Vec<String> = processes
        .iter()
        .filter(|p| p.command.starts_with(command))
        .filter(|p| port.map_or(true, |port| p.port == port))
        .map(|p| p.pid.to_string())
        .collect();

    ExecOutput {
        exit_code: Some(if pids.is_empty() { 1 } else { 0 }),
        stdout: pids.iter().map(|p| format!("{}\n", p)).collect(),
        stderr: String::new(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .networks
            .get(name)
            .map(|spec| NetworkInfo {
                id: format!("net-{}", spec.name),
                name: spec.name.clone(),
            }))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkInfo> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateNetwork(spec.name.clone()));
        if state.networks.contains_key(&spec.name) {
            return Err(RuntimeError::Other(format!(
                "network with name {} already exists",
                spec.name
            )));
        }
        state.networks.insert(spec.name.clone(), spec.clone());
        Ok(NetworkInfo {
            id: format!("net-{}", spec.name),
            name: spec.name.clone(),
        })
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
        ipv4_address: Option<Ipv4Addr>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ConnectNetwork {
            network: network.to_string(),
            container: container.to_string(),
            aliases: aliases.to_vec(),
            ipv4_address,
        });
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::Other(format!("network {} not found", network)));
        }
        let c = state
            .containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::Other(format!("No such container: {}", container)))?;
        if c.networks.contains_key(network) {
            return Err(RuntimeError::Other(format!(
                "endpoint with name {} already exists in network {}",
                container, network
            )));
        }
        c.networks.insert(network.to_string(), aliases.to_vec());
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DisconnectNetwork {
            network: network.to_string(),
            container: container.to_string(),
        });
        let c = state
            .containers
            .get_mut(container)
            .ok_or_else(|| RuntimeError::Other(format!("No such container: {}", container)))?;
        c.networks.remove(network);
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(tag))
    }

    async fn build_image(&self, request: BuildRequest<'_>) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::BuildImage {
            tag: request.tag.to_string(),
            dockerfile: request.dockerfile.to_string(),
            context: request.context.to_path_buf(),
        });
        state.images.insert(request.tag.to_string());
        Ok(format!("Successfully tagged {}:latest\n", request.tag))
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::RemoveImage(tag.to_string()));
        state.images.remove(tag);
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::RunContainer(spec.name.clone()));
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Other(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        state.next_id += 1;
        let id = format!("fake{}", state.next_id);
        let mut networks = BTreeMap::new();
        networks.insert(spec.network.clone(), Vec::new());
        state.containers.insert(
            spec.name.clone(),
            Container {
                id: id.clone(),
                spec: spec.clone(),
                running: true,
                networks,
                processes: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        Ok(self.state.lock().unwrap().containers.get(name).map(info))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.running)
            .map(info)
            .collect())
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::StopContainer(name.to_string()));
        let c = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::Other(format!("No such container: {}", name)))?;
        c.running = false;
        c.processes.clear();
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::RemoveContainer(name.to_string()));
        let removed = state
            .containers
            .remove(name)
            .ok_or_else(|| RuntimeError::Other(format!("No such container: {}", name)))?;
        if state.respawn.contains(name) {
            state.containers.insert(
                name.to_string(),
                Container {
                    running: true,
                    processes: Vec::new(),
                    ..removed
                },
            );
        }
        Ok(())
    }

    async fn exec(&self, container: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Exec {
            container: container.to_string(),
            argv: argv.to_vec(),
            mode,
        });
        let lsof_exit = state.lsof_exit;
        state.next_pid += 1;
        let pid = 100 + state.next_pid;

        let c = state
            .containers
            .get_mut(container)
            .filter(|c| c.running)
            .ok_or_else(|| {
                RuntimeError::Other(format!("Container {} is not running", container))
            })?;

        let program = argv.first().map(String::as_str).unwrap_or_default();
        let output = match program {
            "lsof" => match lsof_exit {
                Some(code) => ExecOutput {
                    exit_code: Some(code),
                    stdout: String::new(),
                    stderr: "lsof: status error".to_string(),
                },
                None => lsof(&c.processes, argv),
            },
            "cat" => {
                let process = argv
                    .get(1)
                    .and_then(|path| path.strip_prefix("/proc/"))
                    .and_then(|rest| rest.strip_suffix("/cmdline"))
                    .and_then(|pid| pid.parse::<u32>().ok())
                    .and_then(|pid| c.processes.iter().find(|p| p.pid == pid));
                match process {
                    Some(p) => ExecOutput {
                        exit_code: Some(0),
                        stdout: p.argv.iter().map(|a| format!("{}\0", a)).collect(),
                        stderr: String::new(),
                    },
                    None => ExecOutput {
                        exit_code: Some(1),
                        stdout: String::new(),
                        stderr: "cat: No such file or directory".to_string(),
                    },
                }
            }
            "kill" => {
                let pids: BTreeSet<u32> = argv[2..].iter().filter_map(|p| p.parse().ok()).collect();
                let before = c.processes.len();
                c.processes.retain(|p| !pids.contains(&p.pid));
                let all_found = before - c.processes.len() == pids.len();
                ExecOutput {
                    exit_code: Some(if all_found { 0 } else { 1 }),
                    ..Default::default()
                }
            }
            _ => {
                // A forwarder: binds `-p`, relays to `-P`. A taken port makes it exit.
                let port = flag_value(argv, "-p")
                    .and_then(|bind| bind.rsplit(':').next())
                    .and_then(|p| p.parse::<u16>().ok());
                let target = flag_value(argv, "-P").unwrap_or_default().to_string();
                if let Some(port) = port {
                    if !c.processes.iter().any(|p| p.port == port) {
                        let command = program.rsplit('/').next().unwrap_or(program).to_string();
                        c.processes.push(Process {
                            pid,
                            command,
                            port,
                            target,
                            argv: argv.to_vec(),
                        });
                    }
                }
                ExecOutput {
                    exit_code: match mode {
                        ExecMode::Capture => Some(0),
                        ExecMode::Detach => None,
                    },
                    ..Default::default()
                }
            }
        };
        Ok(output)
    }
}

pub fn fleet(runtime: &FakeRuntime) -> Fleet {
    fleet_with(runtime, FleetConfig::default())
}

pub fn fleet_with(runtime: &FakeRuntime, config: FleetConfig) -> Fleet {
    Fleet::new(Arc::new(runtime.clone()), config)
}

/// A fake with the isolated network and a running switch.
pub async fn with_switch() -> (FakeRuntime, Fleet) {
    let runtime = FakeRuntime::new();
    let fleet = fleet(&runtime);
    fleet.network.ensure_network().await.unwrap();
    fleet.switch.ensure_running().await.unwrap();
    runtime.clear_calls();
    (runtime, fleet)
}
