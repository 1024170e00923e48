use serde::Serialize;
use socks_fleet::Fleet;

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub killed: Vec<u32>,
}

pub async fn route(fleet: &Fleet, name: String, port: u16) -> anyhow::Result<String> {
    let route = fleet.router.route(&name, port).await?;
    Ok(serde_json::to_string(&route)?)
}

pub async fn disconnect_all(fleet: &Fleet) -> anyhow::Result<String> {
    let killed = fleet.router.disconnect_all().await?;
    Ok(serde_json::to_string(&DisconnectResponse { killed })?)
}
