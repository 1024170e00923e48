//! Configuration file support for socks-fleet.
//!
//! Reads configuration from `~/.config/socks-fleet/config.toml` unless a path
//! is given explicitly (`--config` or `SOCKS_FLEET_CONFIG`). Every field has a
//! default, so a missing file yields the stock fleet layout.
//!
//! ## Example config
//!
//! ```toml
//! [network]
//! subnet = "10.58.0.0/16"
//! gateway = "10.58.0.1"
//! switch_address = "10.58.0.2"
//!
//! [forwarder]
//! unlimited_rate = true
//!
//! [proxy]
//! vpn_dir = "/srv/vpn"
//! ```
//!
//! The loaded [`FleetConfig`] is immutable and handed to each component at
//! construction.

use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The isolated bridge network shared by the switch and every proxy backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: String,
    /// Address pool. The allocatable range is the whole pool.
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    /// Reserved address of the switch on the isolated network.
    pub switch_address: Ipv4Addr,
    /// Network the switch publishes its host ports on.
    pub host_network: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: "ovpn_socks_net".to_string(),
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 58, 0, 0), 16).expect("valid prefix length"),
            gateway: Ipv4Addr::new(10, 58, 0, 1),
            switch_address: Ipv4Addr::new(10, 58, 0, 2),
            host_network: "bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub name: String,
    pub image: String,
    /// DNS alias of the switch on the isolated network.
    pub alias: String,
    pub port_band_start: u16,
    pub port_band_len: u16,
    pub stop_grace_secs: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            name: "ovpn_socks_switch".to_string(),
            image: "ovpn_socks_switch".to_string(),
            alias: "switch".to_string(),
            port_band_start: 50000,
            port_band_len: 1000,
            stop_grace_secs: 1,
        }
    }
}

impl SwitchConfig {
    /// Every host port the switch publishes, in order.
    pub fn port_band(&self) -> impl Iterator<Item = u16> {
        let start = u32::from(self.port_band_start);
        let end = self.port_band_end();
        (start..end).map(|p| p as u16)
    }

    /// Exclusive upper bound of the band.
    pub fn port_band_end(&self) -> u32 {
        u32::from(self.port_band_start) + u32::from(self.port_band_len)
    }

    pub fn in_band(&self, port: u16) -> bool {
        port >= self.port_band_start && u32::from(port) < self.port_band_end()
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// The forwarder binary shipped in the switch image.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Path of the binary inside the switch container.
    pub binary: String,
    /// Command name the kernel reports for forwarder processes.
    pub command_name: String,
    /// Directory inside the switch where each forwarder writes `<name>.log`.
    pub log_dir: String,
    /// Pass `--max-conns-rate=0` to lift the connection-rate limit.
    pub unlimited_rate: bool,
    /// Poll for the listening socket after launch.
    pub verify_bind: bool,
    pub verify_attempts: u32,
    pub verify_interval_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            binary: "./goproxy/proxy".to_string(),
            command_name: "proxy".to_string(),
            log_dir: "/tmp".to_string(),
            unlimited_rate: false,
            verify_bind: false,
            verify_attempts: 5,
            verify_interval_ms: 200,
        }
    }
}

impl ForwarderConfig {
    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub ovpn_image: String,
    pub wg_image: String,
    pub ovpn_prefix: String,
    pub wg_prefix: String,
    /// Host directory with `.ovpn`/`.conf` files and auth material, mounted at `/vpn`.
    pub vpn_dir: PathBuf,
    /// First port handed out by `start-random`.
    pub port_base: u16,
    pub tun_device: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ovpn_image: "ovpn_socks_proxy".to_string(),
            wg_image: "wg_socks_proxy".to_string(),
            ovpn_prefix: "vpn_proxy_".to_string(),
            wg_prefix: "wg_proxy_".to_string(),
            vpn_dir: PathBuf::from("./vpn"),
            port_base: 50100,
            tun_device: "/dev/net/tun".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Build context holding `Dockerfile-switch`, `Dockerfile-vpn` and `Dockerfile-wg`.
    pub dockerfile_dir: PathBuf,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            dockerfile_dir: PathBuf::from("./dockerfiles"),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub network: NetworkConfig,
    pub switch: SwitchConfig,
    pub forwarder: ForwarderConfig,
    pub proxy: ProxyConfig,
    pub images: ImagesConfig,
}

impl FleetConfig {
    /// Load configuration, preferring `path`, then `SOCKS_FLEET_CONFIG`, then
    /// the default path.
    ///
    /// Returns default config if no file exists at the default path. An
    /// explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("SOCKS_FLEET_CONFIG").map(PathBuf::from));

        let config = match explicit {
            Some(path) => Self::load_from(&path)?,
            None => {
                let path = Self::default_path();
                if !path.exists() {
                    tracing::debug!("No config file at {:?}, using defaults", path);
                    Self::default()
                } else {
                    Self::load_from(&path)?
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: FleetConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::info!(path = ?path, network = %config.network.name, "Loaded config");
        Ok(config)
    }

    /// Default config file path: `~/.config/socks-fleet/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("socks-fleet")
            .join("config.toml")
    }

    /// Check the addressing and port band are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if !net.subnet.contains(&net.gateway) {
            return Err(ConfigError::Invalid(format!(
                "gateway {} is outside subnet {}",
                net.gateway, net.subnet
            )));
        }
        if !net.subnet.contains(&net.switch_address) {
            return Err(ConfigError::Invalid(format!(
                "switch address {} is outside subnet {}",
                net.switch_address, net.subnet
            )));
        }
        if net.switch_address == net.gateway {
            return Err(ConfigError::Invalid(
                "switch address must differ from the gateway".to_string(),
            ));
        }
        if self.switch.port_band_len == 0 || self.switch.port_band_end() > 65536 {
            return Err(ConfigError::Invalid(format!(
                "port band {}+{} does not fit in the port range",
                self.switch.port_band_start, self.switch.port_band_len
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_stock_layout() {
        let config = FleetConfig::default();
        assert_eq!(config.network.name, "ovpn_socks_net");
        assert_eq!(config.network.subnet.to_string(), "10.58.0.0/16");
        assert_eq!(config.switch.port_band().count(), 1000);
        assert_eq!(config.switch.port_band().next(), Some(50000));
        assert_eq!(config.switch.port_band().last(), Some(50999));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[network]
name = "lab_net"

[forwarder]
unlimited_rate = true
"#;
        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.network.name, "lab_net");
        assert_eq!(config.network.gateway, Ipv4Addr::new(10, 58, 0, 1));
        assert!(config.forwarder.unlimited_rate);
        assert_eq!(config.forwarder.binary, "./goproxy/proxy");
    }

    #[test]
    fn test_empty_config() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert_eq!(config.switch.name, "ovpn_socks_switch");
        assert_eq!(config.proxy.port_base, 50100);
    }

    #[test]
    fn test_switch_outside_subnet_rejected() {
        let toml = r#"
[network]
subnet = "10.60.0.0/16"
gateway = "10.60.0.1"
switch_address = "10.58.0.2"
"#;
        let config: FleetConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_port_band_overflow_rejected() {
        let mut config = FleetConfig::default();
        config.switch.port_band_start = 65000;
        config.switch.port_band_len = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_in_band() {
        let switch = SwitchConfig::default();
        assert!(switch.in_band(50000));
        assert!(switch.in_band(50999));
        assert!(!switch.in_band(51000));
        assert!(!switch.in_band(49999));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[proxy]\nport_base = 50200\n").unwrap();
        let config = FleetConfig::load(Some(&path)).unwrap();
        assert_eq!(config.proxy.port_base, 50200);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let err = FleetConfig::load(Some(Path::new("/nonexistent/fleet.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_default_path() {
        let path = FleetConfig::default_path();
        assert!(path.ends_with("socks-fleet/config.toml"));
    }
}
