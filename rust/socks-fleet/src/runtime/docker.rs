//! [`ContainerRuntime`] backed by the Docker Engine API via bollard.

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, DeviceMapping, EndpointIpamConfig, EndpointSettings, HostConfig, Ipam,
    IpamConfig, NetworkConnectRequest, NetworkCreateRequest, NetworkDisconnectRequest,
    PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptions, InspectContainerOptions,
    InspectNetworkOptions, ListContainersOptions, RemoveContainerOptions, RemoveImageOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    BuildRequest, ContainerInfo, ContainerRuntime, ContainerSpec, ExecMode, ExecOutput,
    NetworkInfo, NetworkSpec, Result, RuntimeError,
};

/// True for the daemon's 404 response.
fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .published_ports
            .iter()
            .map(|p| (format!("{}/tcp", p), HashMap::new()))
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .published_ports
            .iter()
            .map(|p| {
                (
                    format!("{}/tcp", p),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(p.to_string()),
                    }]),
                )
            })
            .collect();

        let devices = spec
            .devices
            .iter()
            .map(|d| {
                let (host, container) = d.split_once(':').unwrap_or((d.as_str(), d.as_str()));
                DeviceMapping {
                    path_on_host: Some(host.to_string()),
                    path_in_container: Some(container.to_string()),
                    cgroup_permissions: Some("rwm".to_string()),
                }
            })
            .collect::<Vec<_>>();

        let restart_policy = spec.restart_always.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        });

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone().into_iter().collect()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                network_mode: Some(spec.network.clone()),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                devices: (!devices.is_empty()).then_some(devices),
                cap_add: (!spec.cap_add.is_empty()).then(|| spec.cap_add.clone()),
                sysctls: (!spec.sysctls.is_empty())
                    .then(|| spec.sysctls.clone().into_iter().collect()),
                restart_policy,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(network) => Ok(Some(NetworkInfo {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_else(|| name.to_string()),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<NetworkInfo> {
        let request = NetworkCreateRequest {
            name: spec.name.clone(),
            driver: Some(spec.driver.clone()),
            ipam: Some(Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.clone()),
                    ip_range: Some(spec.ip_range.clone()),
                    gateway: Some(spec.gateway.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker.create_network(request).await?;
        Ok(NetworkInfo {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
        ipv4_address: Option<Ipv4Addr>,
    ) -> Result<()> {
        let endpoint = EndpointSettings {
            aliases: Some(aliases.to_vec()),
            ipam_config: ipv4_address.map(|addr| EndpointIpamConfig {
                ipv4_address: Some(addr.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .connect_network(
                network,
                NetworkConnectRequest {
                    container: Some(container.to_string()),
                    endpoint_config: Some(endpoint),
                },
            )
            .await?;
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<()> {
        self.docker
            .disconnect_network(
                network,
                NetworkDisconnectRequest {
                    container: Some(container.to_string()),
                    force: Some(true),
                },
            )
            .await?;
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, request: BuildRequest<'_>) -> Result<String> {
        let context_err = |source| RuntimeError::BuildContext {
            path: request.context.to_path_buf(),
            source,
        };
        let mut tar_builder = tar::Builder::new(Vec::new());
        tar_builder
            .append_dir_all(".", request.context)
            .map_err(context_err)?;
        let tar_data = tar_builder.into_inner().map_err(context_err)?;

        let options = BuildImageOptionsBuilder::default()
            .dockerfile(request.dockerfile)
            .t(request.tag)
            .rm(true)
            .build();

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(tar_data.into())));

        let mut log = String::new();
        while let Some(result) = build_stream.next().await {
            let info = result?;
            if let Some(error) = info.error {
                return Err(RuntimeError::Build(error));
            }
            if let Some(stream) = info.stream {
                debug!(tag = request.tag, "Build: {}", stream.trim_end());
                log.push_str(&stream);
            }
            if let Some(status) = info.status {
                log.push_str(&status);
                log.push('\n');
            }
        }

        Ok(log)
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        match self
            .docker
            .remove_image(tag, None::<RemoveImageOptions>, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(Some(options), Self::container_body(spec))
            .await?;
        self.docker
            .start_container(&container.id, None::<StartContainerOptions>)
            .await?;

        Ok(container.id)
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);
                let labels = info
                    .config
                    .and_then(|c| c.labels)
                    .map(|l| l.into_iter().collect())
                    .unwrap_or_default();
                Ok(Some(ContainerInfo {
                    id: info.id.unwrap_or_default(),
                    name: info
                        .name
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_else(|| name.to_string()),
                    running,
                    labels,
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::default()))
            .await?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerInfo {
                    id: summary.id.unwrap_or_default(),
                    name,
                    running: true,
                    labels: summary
                        .labels
                        .map(|l| l.into_iter().collect())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        let stop_options = StopContainerOptions {
            t: Some(grace.as_secs().min(i32::MAX as u64) as i32),
            ..Default::default()
        };

        match self.docker.stop_container(name, Some(stop_options)).await {
            Ok(_) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(name, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn exec(&self, container: &str, argv: &[String], mode: ExecMode) -> Result<ExecOutput> {
        let attach = mode == ExecMode::Capture;
        let exec_options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(attach),
            attach_stderr: Some(attach),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container, exec_options).await?;

        if mode == ExecMode::Detach {
            let start_options = StartExecOptions {
                detach: true,
                ..Default::default()
            };
            self.docker.start_exec(&exec.id, Some(start_options)).await?;
            return Ok(ExecOutput::default());
        }

        let start_result = self.docker.start_exec(&exec.id, None).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend_from_slice(&message);
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.extend_from_slice(&message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Error reading exec output: {}", e);
                        }
                    }
                }
            }
            StartExecResults::Detached => {
                warn!("Exec started in detached mode unexpectedly");
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }
}
