//! Error types for fleet operations.

use crate::runtime::RuntimeError;

/// Errors raised by the network, switch, router and fleet components.
///
/// NotFound conditions never show up here: an absent network, container or
/// image is a valid state and is handled where it is observed.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// A container runtime call failed. The daemon's message is kept as-is.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Proxy request is missing one or more fields. Lists every missing field.
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    /// The isolated network does not exist. The switch cannot route without it.
    #[error("network {0} does not exist")]
    NetworkMissing(String),

    /// The isolated network is absent when attaching a container to it.
    #[error("network {0} not found; run `socks-fleet network create` first")]
    NetworkNotFound(String),

    #[error("switch container {0} not found")]
    SwitchNotFound(String),

    /// A switch container reappeared after it was torn down.
    #[error("switch container {0} still present after teardown")]
    SwitchConflict(String),

    #[error("invalid backend name {0:?}: expected [A-Za-z0-9][A-Za-z0-9_.-]*")]
    InvalidName(String),

    /// A command inside a container ran but failed.
    #[error("`{command}` in {container} exited with {code}: {stderr}")]
    ExecFailed {
        container: String,
        command: String,
        code: i64,
        stderr: String,
    },

    #[error("no forwarder listening on port {port} for {name}")]
    ForwarderNotBound { name: String, port: u16 },

    #[error("port {port} is outside the switch band {start}..{end}")]
    PortOutsideBand { port: u32, start: u16, end: u32 },

    #[error("no candidate configurations in {0}")]
    NoCandidates(std::path::PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FleetError {
    /// Fatal errors abort the whole program rather than the current operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FleetError::NetworkMissing(_))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_lists_every_field() {
        let err = FleetError::MissingFields(vec!["ovpn", "ovpn_auth"]);
        assert_eq!(err.to_string(), "missing required fields: ovpn, ovpn_auth");
    }

    #[test]
    fn only_network_missing_is_fatal() {
        assert!(FleetError::NetworkMissing("ovpn_socks_net".into()).is_fatal());
        assert!(!FleetError::NetworkNotFound("ovpn_socks_net".into()).is_fatal());
        assert!(!FleetError::SwitchNotFound("ovpn_socks_switch".into()).is_fatal());
        assert!(!FleetError::MissingFields(vec!["name"]).is_fatal());
    }
}
