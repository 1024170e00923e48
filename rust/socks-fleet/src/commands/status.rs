use socks_fleet::Fleet;

pub async fn restart(fleet: &Fleet) -> anyhow::Result<String> {
    let restarted = fleet.restart_system().await?;
    Ok(serde_json::to_string(&restarted)?)
}

pub async fn status(fleet: &Fleet) -> anyhow::Result<String> {
    let status = fleet.status().await?;
    Ok(serde_json::to_string_pretty(&status)?)
}
