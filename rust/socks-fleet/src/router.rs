//! Forwarder reconciliation inside the switch.
//!
//! Each routed port gets one forwarder process in the switch that relays host
//! traffic to `<backend>:<port>` on the isolated network. Routing a port always
//! kills whatever forwarder already listens there before launching the new one,
//! so reassigning a port to another backend never leaves a stale relay behind.
//!
//! Forwarders are found with `lsof`, selected by command name. This is a
//! best-effort heuristic: a renamed forwarder is missed, and an unrelated
//! process whose name starts with the same string is killed too.
//!
//! Every command is an argument vector handed to exec; nothing goes through a
//! shell. Callers must not route the same port concurrently: the kill and the
//! launch are two separate execs.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ForwarderConfig, SwitchConfig};
use crate::error::{FleetError, Result};
use crate::runtime::{ContainerRuntime, ExecMode};

/// `lsof` exits 1 when nothing matched.
const LSOF_NO_MATCH: i64 = 1;

/// Result of one `route` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub name: String,
    pub port: u16,
    /// Forwarder pids killed before the launch.
    pub replaced: Vec<u32>,
}

/// A forwarder process found in the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Forwarder {
    pub pid: u32,
    /// Backend the forwarder relays to.
    pub name: String,
    pub port: u16,
}

/// Backend names end up in container hostnames and log paths.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(FleetError::InvalidName(name.to_string()))
    }
}

/// Parse `lsof -t` output: one pid per line.
fn parse_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Parse a NUL-separated `/proc/<pid>/cmdline` and return the `-P` upstream.
fn parse_upstream(cmdline: &str) -> Option<(String, u16)> {
    let mut args = cmdline.split('\0');
    args.by_ref().find(|arg| *arg == "-P")?;
    let (name, port) = args.next()?.rsplit_once(':')?;
    Some((name.to_string(), port.parse().ok()?))
}

pub struct PortRouter {
    runtime: Arc<dyn ContainerRuntime>,
    switch: SwitchConfig,
    forwarder: ForwarderConfig,
}

impl PortRouter {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        switch: SwitchConfig,
        forwarder: ForwarderConfig,
    ) -> Self {
        Self {
            runtime,
            switch,
            forwarder,
        }
    }

    /// Query for forwarder pids listening on `port`, or on any TCP port.
    pub fn listener_query(&self, port: Option<u16>) -> Vec<String> {
        let socket = match port {
            Some(port) => format!("-iTCP:{}", port),
            None => "-iTCP".to_string(),
        };
        vec![
            "lsof".to_string(),
            "-a".to_string(),
            "-t".to_string(),
            "-c".to_string(),
            self.forwarder.command_name.clone(),
            socket,
            "-sTCP:LISTEN".to_string(),
        ]
    }

    pub fn forwarder_command(&self, name: &str, port: u16) -> Vec<String> {
        let mut argv = vec![self.forwarder.binary.clone(), "socks".to_string()];
        if self.forwarder.unlimited_rate {
            argv.push("--max-conns-rate=0".to_string());
        }
        argv.extend([
            "-t".to_string(),
            "tcp".to_string(),
            "-p".to_string(),
            format!("0.0.0.0:{}", port),
            "-T".to_string(),
            "tcp".to_string(),
            "-P".to_string(),
            format!("{}:{}", name, port),
            "--log".to_string(),
            format!("{}/{}.log", self.forwarder.log_dir.trim_end_matches('/'), name),
        ]);
        argv
    }

    /// True when the switch container exists and is running.
    async fn switch_running(&self) -> Result<bool> {
        Ok(self
            .runtime
            .inspect_container(&self.switch.name)
            .await?
            .is_some_and(|info| info.running))
    }

    async fn listeners(&self, port: Option<u16>) -> Result<Vec<u32>> {
        let argv = self.listener_query(port);
        let output = self
            .runtime
            .exec(&self.switch.name, &argv, ExecMode::Capture)
            .await?;

        match output.exit_code {
            None | Some(0) | Some(LSOF_NO_MATCH) => Ok(parse_pids(&output.stdout)),
            Some(code) => Err(FleetError::ExecFailed {
                container: self.switch.name.clone(),
                command: argv.join(" "),
                code,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Kill forwarders listening on `port` (or on any port) and return their pids.
    async fn kill_listeners(&self, port: Option<u16>) -> Result<Vec<u32>> {
        let pids = self.listeners(port).await?;
        self.kill(port, pids).await
    }

    async fn kill(&self, port: Option<u16>, pids: Vec<u32>) -> Result<Vec<u32>> {
        if pids.is_empty() {
            debug!(?port, "No forwarder listening");
            return Ok(pids);
        }

        let mut argv = vec!["kill".to_string(), "-9".to_string()];
        argv.extend(pids.iter().map(u32::to_string));
        let output = self
            .runtime
            .exec(&self.switch.name, &argv, ExecMode::Capture)
            .await?;

        // A forwarder that exited between the query and the kill is fine.
        if let Some(code) = output.exit_code.filter(|c| *c != 0) {
            warn!(?port, code, stderr = %output.stderr.trim(), "kill reported failure");
        }
        info!(?port, ?pids, "Killed forwarders");
        Ok(pids)
    }

    /// Backend a forwarder relays to, read from its command line. `None` when
    /// the process is gone or was not started with `-P`.
    async fn upstream(&self, pid: u32) -> Result<Option<(String, u16)>> {
        let argv = vec!["cat".to_string(), format!("/proc/{}/cmdline", pid)];
        let output = self
            .runtime
            .exec(&self.switch.name, &argv, ExecMode::Capture)
            .await?;
        if output.exit_code.is_some_and(|c| c != 0) {
            return Ok(None);
        }
        Ok(parse_upstream(&output.stdout))
    }

    async fn forwarders_on(&self, port: Option<u16>) -> Result<Vec<Forwarder>> {
        let mut forwarders = Vec::new();
        for pid in self.listeners(port).await? {
            match self.upstream(pid).await? {
                Some((name, port)) => forwarders.push(Forwarder { pid, name, port }),
                None => debug!(pid, "Listener without an upstream, skipping"),
            }
        }
        Ok(forwarders)
    }

    /// Point host port `port` at backend `name`.
    ///
    /// Without `verify_bind` the only confirmation is that the launch exec was
    /// accepted; the router does not check the forwarder bound the port or
    /// that the backend answers.
    pub async fn route(&self, name: &str, port: u16) -> Result<Route> {
        validate_name(name)?;
        if !self.switch.in_band(port) {
            return Err(FleetError::PortOutsideBand {
                port: u32::from(port),
                start: self.switch.port_band_start,
                end: self.switch.port_band_end(),
            });
        }
        if !self.switch_running().await? {
            return Err(FleetError::SwitchNotFound(self.switch.name.clone()));
        }

        info!(name, port, "Connecting backend to switch");
        let replaced = self.kill_listeners(Some(port)).await?;

        let argv = self.forwarder_command(name, port);
        self.runtime
            .exec(&self.switch.name, &argv, ExecMode::Detach)
            .await?;

        if self.forwarder.verify_bind {
            self.wait_for_listener(name, port).await?;
        }

        Ok(Route {
            name: name.to_string(),
            port,
            replaced,
        })
    }

    async fn wait_for_listener(&self, name: &str, port: u16) -> Result<()> {
        for attempt in 1..=self.forwarder.verify_attempts {
            tokio::time::sleep(self.forwarder.verify_interval()).await;
            if !self.listeners(Some(port)).await?.is_empty() {
                debug!(name, port, attempt, "Forwarder bound");
                return Ok(());
            }
        }
        Err(FleetError::ForwarderNotBound {
            name: name.to_string(),
            port,
        })
    }

    /// Kill the forwarder on `port` if it still relays to `name`.
    ///
    /// A port that was rerouted to another backend is left alone. A missing
    /// switch is a no-op.
    pub async fn unroute(&self, name: &str, port: u16) -> Result<Vec<u32>> {
        if !self.switch_running().await? {
            return Ok(Vec::new());
        }

        let (owned, foreign): (Vec<_>, Vec<_>) = self
            .forwarders_on(Some(port))
            .await?
            .into_iter()
            .partition(|f| f.name == name);
        for other in &foreign {
            info!(port, backend = %other.name, stopped = name, "Port rerouted, keeping forwarder");
        }
        self.kill(Some(port), owned.into_iter().map(|f| f.pid).collect())
            .await
    }

    /// Kill every forwarder in the switch regardless of port or backend.
    ///
    /// A missing switch is a no-op.
    pub async fn disconnect_all(&self) -> Result<Vec<u32>> {
        info!("Disconnecting all proxies from switch");
        if !self.switch_running().await? {
            info!(switch = %self.switch.name, "No switch running, skipping");
            return Ok(Vec::new());
        }
        self.kill_listeners(None).await
    }

    /// Pids of forwarders currently listening. Empty when there is no switch.
    pub async fn forwarder_pids(&self) -> Result<Vec<u32>> {
        if !self.switch_running().await? {
            return Ok(Vec::new());
        }
        self.listeners(None).await
    }

    /// Forwarders currently listening, with the backend each relays to.
    /// Empty when there is no switch.
    pub async fn forwarders(&self) -> Result<Vec<Forwarder>> {
        if !self.switch_running().await? {
            return Ok(Vec::new());
        }
        self.forwarders_on(None).await
    }
}
