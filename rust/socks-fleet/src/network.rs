//! Isolated bridge network shared by the switch and every proxy backend.

use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

use crate::config::NetworkConfig;
use crate::error::{FleetError, Result};
use crate::runtime::{ContainerRuntime, NetworkSpec};

pub struct NetworkRegistrar {
    runtime: Arc<dyn ContainerRuntime>,
    config: NetworkConfig,
}

impl NetworkRegistrar {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: NetworkConfig) -> Self {
        Self { runtime, config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The create parameters. The allocatable range is the whole pool.
    pub fn spec(&self) -> NetworkSpec {
        NetworkSpec {
            name: self.config.name.clone(),
            driver: "bridge".to_string(),
            subnet: self.config.subnet.to_string(),
            ip_range: self.config.subnet.to_string(),
            gateway: self.config.gateway.to_string(),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.runtime.inspect_network(&self.config.name).await?.is_some())
    }

    /// Create the network unless one with the same name exists.
    ///
    /// An existing network is accepted as-is; its parameters are not compared.
    /// Returns `true` when a network was created.
    pub async fn ensure_network(&self) -> Result<bool> {
        if self.exists().await? {
            info!(network = %self.config.name, "Network already exists, skipping");
            return Ok(false);
        }

        let created = self.runtime.create_network(&self.spec()).await?;
        info!(
            network = %created.name,
            id = %created.id,
            subnet = %self.config.subnet,
            "Created network"
        );
        Ok(true)
    }

    /// Connect a container under the given aliases, optionally pinning its address.
    pub async fn attach(
        &self,
        container: &str,
        aliases: &[String],
        fixed_address: Option<Ipv4Addr>,
    ) -> Result<()> {
        if !self.exists().await? {
            return Err(FleetError::NetworkNotFound(self.config.name.clone()));
        }

        self.runtime
            .connect_network(&self.config.name, container, aliases, fixed_address)
            .await?;
        info!(network = %self.config.name, container, ?aliases, ?fixed_address, "Attached container");
        Ok(())
    }

    pub async fn detach(&self, container: &str) -> Result<()> {
        self.runtime
            .disconnect_network(&self.config.name, container)
            .await?;
        info!(network = %self.config.name, container, "Detached container");
        Ok(())
    }
}
