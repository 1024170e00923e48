//! Proxy backends: one VPN tunnel container per dedicated switch port.

use clap::ValueEnum;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{FleetConfig, ProxyConfig, SwitchConfig};
use crate::error::{FleetError, Result};
use crate::naming;
use crate::network::NetworkRegistrar;
use crate::router::{validate_name, Forwarder, PortRouter, Route};
use crate::runtime::{ContainerRuntime, ContainerSpec};

pub const LABEL_ROLE: &str = "socks-fleet.role";
pub const LABEL_PORT: &str = "socks-fleet.port";
pub const LABEL_TUNNEL: &str = "socks-fleet.tunnel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Openvpn,
    Wireguard,
}

impl TunnelKind {
    fn label(self) -> &'static str {
        match self {
            TunnelKind::Openvpn => "openvpn",
            TunnelKind::Wireguard => "wireguard",
        }
    }
}

/// Unvalidated proxy request as supplied by the operator.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub kind: TunnelKind,
    pub name: Option<String>,
    pub port: Option<u16>,
    /// OpenVPN config path relative to the VPN directory.
    pub ovpn: Option<String>,
    /// OpenVPN auth file name.
    pub ovpn_auth: Option<String>,
    /// WireGuard config path relative to the VPN directory.
    pub wg_conf: Option<String>,
}

impl ProxyRequest {
    pub fn new(kind: TunnelKind) -> Self {
        Self {
            kind,
            name: None,
            port: None,
            ovpn: None,
            ovpn_auth: None,
            wg_conf: None,
        }
    }

    /// Check every required field, reporting all missing ones together.
    ///
    /// Empty strings count as missing.
    pub fn validate(self) -> Result<ProxyBackend> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        let name = present(self.name);
        let ovpn = present(self.ovpn);
        let ovpn_auth = present(self.ovpn_auth);
        let wg_conf = present(self.wg_conf);

        let mut missing = Vec::new();
        if name.is_none() {
            missing.push("name");
        }
        match self.kind {
            TunnelKind::Openvpn => {
                if ovpn.is_none() {
                    missing.push("ovpn");
                }
                if ovpn_auth.is_none() {
                    missing.push("ovpn_auth");
                }
            }
            TunnelKind::Wireguard => {
                if wg_conf.is_none() {
                    missing.push("wg_conf");
                }
            }
        }
        if self.port.is_none() {
            missing.push("port");
        }

        let tunnel = match (self.kind, ovpn, ovpn_auth, wg_conf) {
            (TunnelKind::Openvpn, Some(config), Some(auth), _) => Tunnel::OpenVpn { config, auth },
            (TunnelKind::Wireguard, _, _, Some(config)) => Tunnel::WireGuard { config },
            _ => return Err(FleetError::MissingFields(missing)),
        };

        match (name, self.port) {
            (Some(name), Some(port)) if missing.is_empty() => Ok(ProxyBackend { name, port, tunnel }),
            _ => Err(FleetError::MissingFields(missing)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tunnel {
    OpenVpn { config: String, auth: String },
    WireGuard { config: String },
}

impl Tunnel {
    pub fn kind(&self) -> TunnelKind {
        match self {
            Tunnel::OpenVpn { .. } => TunnelKind::Openvpn,
            Tunnel::WireGuard { .. } => TunnelKind::Wireguard,
        }
    }
}

/// A validated proxy backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBackend {
    pub name: String,
    pub port: u16,
    pub tunnel: Tunnel,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedProxy {
    pub container_id: String,
    pub route: Route,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    pub tunnel: Option<String>,
    pub port: Option<u16>,
}

pub struct ProxyFleet {
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkRegistrar,
    router: PortRouter,
    config: ProxyConfig,
    switch: SwitchConfig,
}

impl ProxyFleet {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &FleetConfig) -> Self {
        Self {
            network: NetworkRegistrar::new(runtime.clone(), config.network.clone()),
            router: PortRouter::new(
                runtime.clone(),
                config.switch.clone(),
                config.forwarder.clone(),
            ),
            runtime,
            config: config.proxy.clone(),
            switch: config.switch.clone(),
        }
    }

    pub fn prefix(&self, kind: TunnelKind) -> &str {
        match kind {
            TunnelKind::Openvpn => &self.config.ovpn_prefix,
            TunnelKind::Wireguard => &self.config.wg_prefix,
        }
    }

    fn stop_grace(&self) -> Duration {
        self.switch.stop_grace()
    }

    /// Host side of the `/vpn` bind mount. Docker needs an absolute path.
    fn vpn_dir(&self) -> Result<PathBuf> {
        std::path::absolute(&self.config.vpn_dir).map_err(|source| FleetError::Io {
            path: self.config.vpn_dir.clone(),
            source,
        })
    }

    pub fn container_spec(&self, backend: &ProxyBackend) -> Result<ContainerSpec> {
        let vpn_dir = self.vpn_dir()?;
        let port = backend.port.to_string();

        let mut sysctls = BTreeMap::new();
        // IPv6 inside the tunnel is broken unless explicitly enabled.
        sysctls.insert("net.ipv6.conf.all.disable_ipv6".to_string(), "0".to_string());

        let (image, env) = match &backend.tunnel {
            Tunnel::OpenVpn { config, auth } => (
                self.config.ovpn_image.clone(),
                vec![
                    format!("OVPN={}", config),
                    format!("OVPN_AUTH={}", auth),
                    format!("PORT={}", port),
                ],
            ),
            Tunnel::WireGuard { config } => {
                sysctls.insert("net.ipv4.conf.all.src_valid_mark".to_string(), "1".to_string());
                (
                    self.config.wg_image.clone(),
                    vec![format!("WG_CONF={}", config), format!("PORT={}", port)],
                )
            }
        };

        let labels = BTreeMap::from([
            (LABEL_ROLE.to_string(), "proxy".to_string()),
            (LABEL_PORT.to_string(), port),
            (LABEL_TUNNEL.to_string(), backend.tunnel.kind().label().to_string()),
        ]);

        Ok(ContainerSpec {
            name: backend.name.clone(),
            image,
            network: self.network.name().to_string(),
            published_ports: Vec::new(),
            binds: vec![format!("{}:/vpn", vpn_dir.display())],
            devices: vec![format!("{0}:{0}", self.config.tun_device)],
            cap_add: vec!["NET_ADMIN".to_string()],
            sysctls,
            env,
            labels,
            restart_always: true,
        })
    }

    /// Validate, start the backend container, then route its port through the switch.
    pub async fn start(&self, request: ProxyRequest) -> Result<StartedProxy> {
        let backend = request.validate()?;
        self.start_backend(&backend).await
    }

    async fn start_backend(&self, backend: &ProxyBackend) -> Result<StartedProxy> {
        validate_name(&backend.name)?;
        let spec = self.container_spec(backend)?;

        info!(name = %backend.name, port = backend.port, tunnel = ?backend.tunnel.kind(), "Starting proxy");
        let container_id = self.runtime.run_container(&spec).await?;

        let route = self.router.route(&backend.name, backend.port).await?;
        Ok(StartedProxy {
            container_id,
            route,
        })
    }

    /// Validate every request first, then start them in order.
    ///
    /// Stops at the first failure; proxies already started stay up.
    pub async fn start_all(&self, requests: Vec<ProxyRequest>) -> Result<Vec<StartedProxy>> {
        let backends = requests
            .into_iter()
            .map(ProxyRequest::validate)
            .collect::<Result<Vec<_>>>()?;

        let mut started = Vec::with_capacity(backends.len());
        for backend in &backends {
            started.push(self.start_backend(backend).await?);
        }
        Ok(started)
    }

    /// Stop and remove every running container whose name starts with `prefix`.
    ///
    /// A forwarder on a removed proxy's port is killed too when it still
    /// relays to that proxy. Ports rerouted to another backend keep theirs.
    pub async fn stop_all(&self, prefix: &str) -> Result<Vec<String>> {
        info!(prefix, "Stopping proxy containers");
        let proxies: Vec<_> = self
            .runtime
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| c.name.starts_with(prefix))
            .collect();

        let mut stopped = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            info!(name = %proxy.name, "Stopping proxy");
            self.runtime
                .stop_container(&proxy.name, self.stop_grace())
                .await?;
            self.runtime.remove_container(&proxy.name).await?;

            if let Some(port) = proxy
                .labels
                .get(LABEL_PORT)
                .and_then(|p| p.parse::<u16>().ok())
            {
                self.router.unroute(&proxy.name, port).await?;
            }
            stopped.push(proxy.name);
        }
        Ok(stopped)
    }

    /// Pick `limit` random OpenVPN configs from `<vpn_dir>/<provider>` and
    /// build requests for them on consecutive ports from `port_base`.
    pub fn plan_random<R: Rng + ?Sized>(
        &self,
        provider: &str,
        auth: &str,
        limit: usize,
        rng: &mut R,
    ) -> Result<Vec<ProxyRequest>> {
        let dir = self.config.vpn_dir.join(provider);
        let candidates = naming::list_candidates(&dir)?;
        if candidates.is_empty() {
            return Err(FleetError::NoCandidates(dir));
        }

        let picked = naming::sample_candidates(&candidates, limit, rng);
        let names = naming::dedupe_names(
            picked
                .iter()
                .map(|file| naming::backend_name(&self.config.ovpn_prefix, file))
                .collect(),
        );

        picked
            .iter()
            .zip(names)
            .enumerate()
            .map(|(i, (file, name))| {
                let wanted = u32::from(self.config.port_base) + i as u32;
                let port = u16::try_from(wanted)
                    .ok()
                    .filter(|p| self.switch.in_band(*p))
                    .ok_or(FleetError::PortOutsideBand {
                        port: wanted,
                        start: self.switch.port_band_start,
                        end: self.switch.port_band_end(),
                    })?;
                Ok(ProxyRequest {
                    name: Some(name),
                    port: Some(port),
                    ovpn: Some(format!("{}/{}", provider, file)),
                    ovpn_auth: Some(auth.to_string()),
                    ..ProxyRequest::new(TunnelKind::Openvpn)
                })
            })
            .collect()
    }

    /// Replace every OpenVPN proxy with the planned set.
    pub async fn replace_openvpn(&self, plan: Vec<ProxyRequest>) -> Result<Vec<StartedProxy>> {
        let prefix = self.config.ovpn_prefix.clone();
        self.stop_all(&prefix).await?;
        self.start_all(plan).await
    }

    /// Put a container started elsewhere on the isolated network under its own
    /// name, then route `port` to it.
    pub async fn adopt(&self, container: &str, port: u16) -> Result<Route> {
        validate_name(container)?;
        self.network
            .attach(container, &[container.to_string()], None)
            .await?;
        self.router.route(container, port).await
    }

    /// Route every running backend again after the switch was replaced.
    ///
    /// Proxies started here are routed to their labeled port. Forwarders seen
    /// before the replacement (`previous`) override the labels for their port
    /// when their backend is still running, which keeps adopted containers and
    /// manual reroutes.
    pub async fn restore_routes(&self, previous: &[Forwarder]) -> Result<Vec<Route>> {
        let running = self.runtime.list_containers().await?;

        let mut wanted: BTreeMap<u16, String> = BTreeMap::new();
        for container in &running {
            if container.labels.get(LABEL_ROLE).map(String::as_str) != Some("proxy") {
                continue;
            }
            if let Some(port) = container
                .labels
                .get(LABEL_PORT)
                .and_then(|p| p.parse::<u16>().ok())
            {
                wanted.insert(port, container.name.clone());
            }
        }
        for forwarder in previous {
            if running.iter().any(|c| c.name == forwarder.name) {
                wanted.insert(forwarder.port, forwarder.name.clone());
            } else {
                debug!(backend = %forwarder.name, port = forwarder.port, "Backend gone, not restoring route");
            }
        }

        let mut restored = Vec::with_capacity(wanted.len());
        for (port, name) in wanted {
            restored.push(self.router.route(&name, port).await?);
        }
        info!(count = restored.len(), "Restored routes");
        Ok(restored)
    }

    /// Running proxies of both tunnel kinds.
    pub async fn list(&self) -> Result<Vec<ProxyStatus>> {
        let mut proxies: Vec<_> = self
            .runtime
            .list_containers()
            .await?
            .into_iter()
            .filter(|c| {
                c.name.starts_with(&self.config.ovpn_prefix)
                    || c.name.starts_with(&self.config.wg_prefix)
            })
            .map(|c| ProxyStatus {
                tunnel: c.labels.get(LABEL_TUNNEL).cloned(),
                port: c.labels.get(LABEL_PORT).and_then(|p| p.parse().ok()),
                name: c.name,
            })
            .collect();
        proxies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(proxies)
    }
}
