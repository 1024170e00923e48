//! socks-fleet: a VPN-over-SOCKS proxy fleet on Docker.
//!
//! One isolated bridge network connects a singleton *switch* container to a
//! set of VPN tunnel containers (OpenVPN or WireGuard). The switch publishes a
//! band of host ports and runs one forwarder per routed port, relaying host
//! traffic to `<backend>:<port>` on the isolated network.
//!
//! ## Modules
//!
//! - [`runtime`]: the container runtime seam and its bollard implementation
//! - [`network`]: the isolated network
//! - [`switch`]: switch container lifecycle
//! - [`router`]: forwarder reconciliation inside the switch
//! - [`fleet`]: proxy backend containers
//! - [`images`]: building the switch and proxy images
//! - [`naming`]: picking VPN configs and deriving backend names
//! - [`system`]: everything wired together

pub mod config;
pub mod error;
pub mod fleet;
pub mod images;
pub mod naming;
pub mod network;
pub mod router;
pub mod runtime;
pub mod switch;
pub mod system;

pub use config::{ConfigError, FleetConfig};
pub use error::{FleetError, Result};
pub use system::{Fleet, FleetStatus, Restarted};
