use serde::Serialize;
use socks_fleet::images::ImageKind;
use socks_fleet::Fleet;

#[derive(Serialize)]
pub struct BuildResponse {
    pub tag: String,
    pub log: String,
}

pub async fn build(fleet: &Fleet, kind: ImageKind) -> anyhow::Result<String> {
    let log = fleet.images.build(kind).await?;
    Ok(serde_json::to_string(&BuildResponse {
        tag: fleet.images.tag(kind).to_string(),
        log,
    })?)
}

pub async fn rebuild(fleet: &Fleet, kind: ImageKind) -> anyhow::Result<String> {
    let log = fleet.images.rebuild(kind).await?;
    Ok(serde_json::to_string(&BuildResponse {
        tag: fleet.images.tag(kind).to_string(),
        log,
    })?)
}
