use serde::Serialize;
use socks_fleet::fleet::{ProxyRequest, TunnelKind};
use socks_fleet::Fleet;

#[derive(Serialize)]
pub struct StopAllResponse {
    pub prefix: String,
    pub stopped: Vec<String>,
}

pub async fn run(
    fleet: &Fleet,
    kind: TunnelKind,
    name: Option<String>,
    port: Option<u16>,
    ovpn: Option<String>,
    ovpn_auth: Option<String>,
    wg_conf: Option<String>,
) -> anyhow::Result<String> {
    let request = ProxyRequest {
        name,
        port,
        ovpn,
        ovpn_auth,
        wg_conf,
        ..ProxyRequest::new(kind)
    };
    let started = fleet.proxies.start(request).await?;
    Ok(serde_json::to_string(&started)?)
}

pub async fn start_random(
    fleet: &Fleet,
    provider: String,
    auth: String,
    limit: usize,
) -> anyhow::Result<String> {
    let plan = fleet
        .proxies
        .plan_random(&provider, &auth, limit, &mut rand::thread_rng())?;
    let started = fleet.proxies.replace_openvpn(plan).await?;
    Ok(serde_json::to_string(&started)?)
}

pub async fn stop_all(
    fleet: &Fleet,
    kind: TunnelKind,
    prefix: Option<String>,
) -> anyhow::Result<String> {
    let prefix = prefix.unwrap_or_else(|| fleet.proxies.prefix(kind).to_string());
    let stopped = fleet.proxies.stop_all(&prefix).await?;
    Ok(serde_json::to_string(&StopAllResponse { prefix, stopped })?)
}

pub async fn adopt(fleet: &Fleet, container: String, port: u16) -> anyhow::Result<String> {
    let route = fleet.proxies.adopt(&container, port).await?;
    Ok(serde_json::to_string(&route)?)
}

pub async fn list(fleet: &Fleet) -> anyhow::Result<String> {
    let proxies = fleet.proxies.list().await?;
    Ok(serde_json::to_string(&proxies)?)
}
