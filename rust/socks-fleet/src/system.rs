//! The whole fleet: network, switch, router, proxies and images wired to one runtime.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::FleetConfig;
use crate::error::Result;
use crate::fleet::{ProxyFleet, ProxyStatus};
use crate::images::ImageBuilder;
use crate::network::NetworkRegistrar;
use crate::router::{PortRouter, Route};
use crate::runtime::ContainerRuntime;
use crate::switch::{SwitchManager, SwitchState};

pub struct Fleet {
    pub network: NetworkRegistrar,
    pub switch: SwitchManager,
    pub router: PortRouter,
    pub proxies: ProxyFleet,
    pub images: ImageBuilder,
    config: FleetConfig,
}

/// Snapshot printed by `socks-fleet status`.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub network: String,
    pub network_present: bool,
    pub switch: SwitchState,
    pub forwarder_pids: Vec<u32>,
    pub proxies: Vec<ProxyStatus>,
}

/// Outcome of `restart_system`.
#[derive(Debug, Clone, Serialize)]
pub struct Restarted {
    pub switch_id: String,
    /// Stopped OpenVPN proxies.
    pub stopped: Vec<String>,
    /// Routes installed on the new switch.
    pub restored: Vec<Route>,
}

impl Fleet {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: FleetConfig) -> Self {
        Self {
            network: NetworkRegistrar::new(runtime.clone(), config.network.clone()),
            switch: SwitchManager::new(
                runtime.clone(),
                config.network.clone(),
                config.switch.clone(),
            ),
            router: PortRouter::new(
                runtime.clone(),
                config.switch.clone(),
                config.forwarder.clone(),
            ),
            proxies: ProxyFleet::new(runtime.clone(), &config),
            images: ImageBuilder::new(runtime, &config),
            config,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Stop every OpenVPN proxy, replace the switch, then route the backends
    /// that are still running through the new switch.
    pub async fn restart_system(&self) -> Result<Restarted> {
        info!("Restarting fleet");
        let previous = self.router.forwarders().await?;
        let stopped = self.proxies.stop_all(&self.config.proxy.ovpn_prefix).await?;
        let switch_id = self.switch.ensure_running().await?;
        let restored = self.proxies.restore_routes(&previous).await?;
        Ok(Restarted {
            switch_id,
            stopped,
            restored,
        })
    }

    pub async fn status(&self) -> Result<FleetStatus> {
        Ok(FleetStatus {
            network: self.network.name().to_string(),
            network_present: self.network.exists().await?,
            switch: self.switch.state().await?,
            forwarder_pids: self.router.forwarder_pids().await?,
            proxies: self.proxies.list().await?,
        })
    }
}
