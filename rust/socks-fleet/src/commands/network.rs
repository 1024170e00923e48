use serde::Serialize;
use socks_fleet::Fleet;
use std::net::Ipv4Addr;

#[derive(Serialize)]
pub struct CreateResponse {
    pub network: String,
    pub created: bool,
}

#[derive(Serialize)]
pub struct AttachResponse {
    pub network: String,
    pub container: String,
    pub aliases: Vec<String>,
}

#[derive(Serialize)]
pub struct DetachResponse {
    pub network: String,
    pub container: String,
}

pub async fn create(fleet: &Fleet) -> anyhow::Result<String> {
    let created = fleet.network.ensure_network().await?;
    Ok(serde_json::to_string(&CreateResponse {
        network: fleet.network.name().to_string(),
        created,
    })?)
}

pub async fn attach(
    fleet: &Fleet,
    container: String,
    mut aliases: Vec<String>,
    ip: Option<Ipv4Addr>,
) -> anyhow::Result<String> {
    if aliases.is_empty() {
        aliases.push(container.clone());
    }
    fleet.network.attach(&container, &aliases, ip).await?;
    Ok(serde_json::to_string(&AttachResponse {
        network: fleet.network.name().to_string(),
        container,
        aliases,
    })?)
}

pub async fn detach(fleet: &Fleet, container: String) -> anyhow::Result<String> {
    fleet.network.detach(&container).await?;
    Ok(serde_json::to_string(&DetachResponse {
        network: fleet.network.name().to_string(),
        container,
    })?)
}
