//! Building the switch and proxy images from the local Dockerfile directory.

use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::FleetConfig;
use crate::error::Result;
use crate::runtime::{BuildRequest, ContainerRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImageKind {
    Switch,
    Openvpn,
    Wireguard,
}

impl ImageKind {
    pub fn dockerfile(self) -> &'static str {
        match self {
            ImageKind::Switch => "Dockerfile-switch",
            ImageKind::Openvpn => "Dockerfile-vpn",
            ImageKind::Wireguard => "Dockerfile-wg",
        }
    }
}

pub struct ImageBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    context: PathBuf,
    switch_tag: String,
    ovpn_tag: String,
    wg_tag: String,
}

impl ImageBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &FleetConfig) -> Self {
        Self {
            runtime,
            context: config.images.dockerfile_dir.clone(),
            switch_tag: config.switch.image.clone(),
            ovpn_tag: config.proxy.ovpn_image.clone(),
            wg_tag: config.proxy.wg_image.clone(),
        }
    }

    pub fn tag(&self, kind: ImageKind) -> &str {
        match kind {
            ImageKind::Switch => &self.switch_tag,
            ImageKind::Openvpn => &self.ovpn_tag,
            ImageKind::Wireguard => &self.wg_tag,
        }
    }

    /// Build the image and return the daemon's build log.
    pub async fn build(&self, kind: ImageKind) -> Result<String> {
        let tag = self.tag(kind);
        info!(tag, dockerfile = kind.dockerfile(), context = ?self.context, "Building image");
        let log = self
            .runtime
            .build_image(BuildRequest {
                context: &self.context,
                dockerfile: kind.dockerfile(),
                tag,
            })
            .await?;
        info!(tag, "Built image");
        Ok(log)
    }

    /// Remove the tagged image if present, then build it again.
    pub async fn rebuild(&self, kind: ImageKind) -> Result<String> {
        let tag = self.tag(kind);
        if self.runtime.image_exists(tag).await? {
            info!(tag, "Removing image");
            self.runtime.remove_image(tag).await?;
        }
        self.build(kind).await
    }
}
