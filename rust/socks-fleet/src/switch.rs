//! Lifecycle of the singleton switch container.
//!
//! The switch publishes the whole host port band on the host network and sits
//! on the isolated network at a reserved address, so forwarders running inside
//! it can reach every proxy backend by name.
//!
//! ```text
//!            ensure_running()
//!   Absent ────────────────────► Running
//!     ▲                            │
//!     │   stop + remove            │ ensure_running() / stop()
//!     └──────── Stopping ◄─────────┘
//! ```
//!
//! Starting always replaces an existing switch; there is no "already correct"
//! fast path.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{NetworkConfig, SwitchConfig};
use crate::error::{FleetError, Result};
use crate::fleet::LABEL_ROLE;
use crate::images::{ImageBuilder, ImageKind};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchState {
    Absent,
    Running,
    /// Present but not running (exited, or restarting between attempts).
    Stopped,
    /// Being torn down before a replacement is created.
    Stopping,
}

pub struct SwitchManager {
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkConfig,
    config: SwitchConfig,
}

impl SwitchManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        network: NetworkConfig,
        config: SwitchConfig,
    ) -> Self {
        Self {
            runtime,
            network,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn find(&self) -> Result<Option<ContainerInfo>> {
        Ok(self.runtime.inspect_container(&self.config.name).await?)
    }

    pub async fn state(&self) -> Result<SwitchState> {
        Ok(match self.find().await? {
            None => SwitchState::Absent,
            Some(info) if info.running => SwitchState::Running,
            Some(_) => SwitchState::Stopped,
        })
    }

    /// The container the switch is created from.
    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            name: self.config.name.clone(),
            image: self.config.image.clone(),
            network: self.network.host_network.clone(),
            published_ports: self.config.port_band().collect(),
            labels: BTreeMap::from([(LABEL_ROLE.to_string(), "switch".to_string())]),
            restart_always: true,
            ..Default::default()
        }
    }

    /// Replace any existing switch with a fresh one and return its id.
    ///
    /// Fails with [`FleetError::NetworkMissing`] (fatal) when the isolated
    /// network does not exist; nothing is created in that case.
    pub async fn ensure_running(&self) -> Result<String> {
        let mut torn_down = false;
        while let Some(existing) = self.find().await? {
            if torn_down {
                return Err(FleetError::SwitchConflict(self.config.name.clone()));
            }
            info!(switch = %existing.name, state = ?SwitchState::Stopping, "Switch present, replacing");
            self.teardown(&existing).await?;
            torn_down = true;
        }

        if self
            .runtime
            .inspect_network(&self.network.name)
            .await?
            .is_none()
        {
            return Err(FleetError::NetworkMissing(self.network.name.clone()));
        }

        self.create().await
    }

    async fn create(&self) -> Result<String> {
        info!(
            switch = %self.config.name,
            band_start = self.config.port_band_start,
            band_len = self.config.port_band_len,
            "Starting switch"
        );

        let id = self.runtime.run_container(&self.container_spec()).await?;

        self.runtime
            .connect_network(
                &self.network.name,
                &self.config.name,
                &[self.config.alias.clone()],
                Some(self.network.switch_address),
            )
            .await?;

        info!(
            switch = %self.config.name,
            address = %self.network.switch_address,
            state = ?SwitchState::Running,
            "Switch running"
        );
        Ok(id)
    }

    async fn teardown(&self, existing: &ContainerInfo) -> Result<()> {
        if existing.running {
            self.runtime
                .stop_container(&existing.name, self.config.stop_grace())
                .await?;
        }
        self.runtime.remove_container(&existing.name).await?;
        info!(switch = %existing.name, state = ?SwitchState::Absent, "Switch removed");
        Ok(())
    }

    /// Stop and remove the switch. Returns `false` when there was none.
    pub async fn stop(&self) -> Result<bool> {
        info!(switch = %self.config.name, "Stopping switch");
        match self.find().await? {
            Some(existing) => {
                self.teardown(&existing).await?;
                Ok(true)
            }
            None => {
                info!(switch = %self.config.name, "Switch not found, nothing to stop");
                Ok(false)
            }
        }
    }

    /// Stop the switch and rebuild its image. The switch is left absent.
    pub async fn rebuild(&self, images: &ImageBuilder) -> Result<String> {
        info!(switch = %self.config.name, "Rebuilding switch");
        self.stop().await?;
        images.build(ImageKind::Switch).await
    }
}
