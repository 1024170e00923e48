use serde::Serialize;
use socks_fleet::switch::SwitchState;
use socks_fleet::Fleet;

#[derive(Serialize)]
pub struct StartResponse {
    pub switch: String,
    pub container_id: String,
}

#[derive(Serialize)]
pub struct StopResponse {
    pub switch: String,
    pub stopped: bool,
}

#[derive(Serialize)]
pub struct RebuildResponse {
    pub switch: String,
    pub state: SwitchState,
    pub log: String,
}

pub async fn start(fleet: &Fleet) -> anyhow::Result<String> {
    let container_id = fleet.switch.ensure_running().await?;
    Ok(serde_json::to_string(&StartResponse {
        switch: fleet.switch.name().to_string(),
        container_id,
    })?)
}

pub async fn stop(fleet: &Fleet) -> anyhow::Result<String> {
    let stopped = fleet.switch.stop().await?;
    Ok(serde_json::to_string(&StopResponse {
        switch: fleet.switch.name().to_string(),
        stopped,
    })?)
}

pub async fn rebuild(fleet: &Fleet) -> anyhow::Result<String> {
    let log = fleet.switch.rebuild(&fleet.images).await?;
    Ok(serde_json::to_string(&RebuildResponse {
        switch: fleet.switch.name().to_string(),
        state: fleet.switch.state().await?,
        log,
    })?)
}
