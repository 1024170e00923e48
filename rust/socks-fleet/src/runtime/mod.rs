//! Container runtime seam.
//!
//! Everything the fleet does goes through [`ContainerRuntime`]. The production
//! implementation ([`DockerRuntime`]) talks to the Docker Engine API through
//! bollard; tests substitute an in-memory fake.
//!
//! ```text
//! NetworkRegistrar ─┐
//! SwitchManager ────┼──► Arc<dyn ContainerRuntime> ──► DockerRuntime ──► dockerd
//! PortRouter ───────┤
//! ProxyFleet ───────┘
//! ```
//!
//! NotFound is part of the contract, not an error: lookups return `Option`.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Error types for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Failed to package build context {path}: {source}")]
    BuildContext {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Used by non-Docker implementations.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Parameters of a bridge network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub subnet: String,
    pub ip_range: String,
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
}

/// Everything needed to create and start one detached container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Network mode the container starts on.
    pub network: String,
    /// TCP ports published 1:1 on the host.
    pub published_ports: Vec<u16>,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
    /// `host:container` device mappings.
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub sysctls: BTreeMap<String, String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub restart_always: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

/// How to run a command inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Wait for the command and collect its output.
    Capture,
    /// Start the command and return immediately.
    Detach,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` for detached commands or when the daemon did not report one.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

/// Image build request. `context` is a directory on the local filesystem.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub context: &'a Path,
    pub dockerfile: &'a str,
    pub tag: &'a str,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>>;
    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkInfo>;
    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
        ipv4_address: Option<Ipv4Addr>,
    ) -> Result<()>;
    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()>;

    async fn image_exists(&self, tag: &str) -> Result<bool>;
    /// Returns the concatenated build log.
    async fn build_image(&self, request: BuildRequest<'_>) -> Result<String>;
    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Create and start a container, returning its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>>;
    /// Running containers only.
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
    /// Stopping an already stopped container is not an error.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn exec(&self, container: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput>;
}
