//! Docker-backed [`ContainerRuntime`] over docktopus/bollard.

use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, InspectContainerOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::image::BuildImageOptions;
use docktopus::bollard::models::{ContainerInspectResponse, HostConfig, PortBinding, PortMap};
use docktopus::container::Container;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{AddressMode, DockerSettings, ImageProfile};
use crate::error::{Result, WorkspaceError};
use crate::runtime::{ContainerRuntime, RuntimeHandle, StartSpec};

pub struct DockerRuntime {
    builder: DockerBuilder,
    settings: DockerSettings,
}

impl DockerRuntime {
    pub async fn connect(settings: DockerSettings) -> Result<Self> {
        let builder = match settings.docker_host.as_deref() {
            Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                WorkspaceError::Docker(format!("Failed to connect to docker at {host}: {err}"))
            })?,
            None => DockerBuilder::new().await.map_err(|err| {
                WorkspaceError::Docker(format!("Failed to connect to docker: {err}"))
            })?,
        };
        Ok(Self { builder, settings })
    }
}

/// 404 (no such container) and 304 (already stopped) mean there is nothing left to do.
fn is_already_gone(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404 | 304,
            ..
        }
    )
}

/// 409 on removal means docker is already removing the container.
fn is_removal_in_progress(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } if message.contains("already in progress")
    )
}

/// Container config override: resource limits, storage quota, bind mount and
/// the workspace port (published to an ephemeral host port).
fn build_docker_config(spec: &StartSpec) -> BollardConfig<String> {
    let port_key = format!("{}/tcp", spec.port);

    let mut port_bindings = PortMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: None,
        }]),
    );
    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let mut host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(spec.binds.clone()),
        ..Default::default()
    };
    if spec.memory_mb > 0 {
        host_config.memory = Some((spec.memory_mb as i64) * 1024 * 1024);
    }
    if let Some(quota) = &spec.storage_quota {
        let mut opts = HashMap::new();
        opts.insert("size".to_string(), quota.clone());
        host_config.storage_opt = Some(opts);
    }

    BollardConfig {
        cmd: if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        },
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// IP of the container on `network`, if docker has assigned one yet.
fn network_ip(inspect: &ContainerInspectResponse, network: &str) -> Option<String> {
    inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.networks.as_ref())
        .and_then(|networks| networks.get(network))
        .and_then(|endpoint| endpoint.ip_address.clone())
        .filter(|ip| !ip.is_empty())
}

fn extract_host_port(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
    container_port: u16,
) -> Option<u16> {
    let key = format!("{container_port}/tcp");
    ports
        .get(&key)
        .and_then(|v| v.as_ref())
        .and_then(|bindings| bindings.first())
        .and_then(|binding| binding.host_port.as_ref())
        .and_then(|port| port.parse::<u16>().ok())
}

fn is_running(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .state
        .as_ref()
        .and_then(|state| state.running)
        .unwrap_or(false)
}

/// Tar the build context directory, rooted at the archive top level.
fn context_tarball(dir: &Path) -> Result<Vec<u8>> {
    let archive_err = |err: std::io::Error| {
        WorkspaceError::Docker(format!(
            "Failed to archive build context {}: {err}",
            dir.display()
        ))
    };
    let mut tar_builder = tar::Builder::new(Vec::new());
    tar_builder.append_dir_all(".", dir).map_err(archive_err)?;
    tar_builder.into_inner().map_err(archive_err)
}

impl DockerRuntime {
    async fn build_from_context(&self, profile: &ImageProfile, context: &Path) -> Result<String> {
        let image = profile.image.clone();
        let dir: PathBuf = context.to_path_buf();
        let tarball = tokio::task::spawn_blocking(move || context_tarball(&dir))
            .await
            .map_err(|err| WorkspaceError::Docker(format!("Build context task failed: {err}")))??;

        info!(
            "docker: building image {image} from {}",
            context.display()
        );
        let build_opts = BuildImageOptions {
            dockerfile: profile.dockerfile.as_str(),
            t: image.as_str(),
            rm: true,
            ..Default::default()
        };
        let client = self.builder.client();
        let mut build_stream = client.build_image(build_opts, None, Some(tarball.into()));

        while let Some(build_result) = build_stream.next().await {
            let info = build_result.map_err(|err| {
                WorkspaceError::Docker(format!("Failed to build image {image}: {err}"))
            })?;
            if let Some(error) = info.error {
                return Err(WorkspaceError::Docker(format!(
                    "Failed to build image {image}: {error}"
                )));
            }
            if let Some(line) = info.stream.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
                debug!("docker: build {image}: {line}");
            }
        }
        Ok(image)
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    /// Build the image when the profile names a build context, otherwise
    /// pull it if it is not present yet.
    async fn build(&self, profile: &ImageProfile) -> Result<String> {
        if let Some(context) = &profile.build_context {
            return self.build_from_context(profile, context).await;
        }
        let image = profile.image.clone();
        let present = self.builder.client().inspect_image(&image).await.is_ok();
        if present {
            debug!("docker: image {image} already present");
            return Ok(image);
        }
        if !self.settings.pull_image {
            return Err(WorkspaceError::Docker(format!(
                "Image {image} is not present and pulling is disabled"
            )));
        }
        info!("docker: pulling image {image}");
        self.builder.pull_image(&image, None).await.map_err(|err| {
            WorkspaceError::Docker(format!("Failed to pull image {image}: {err}"))
        })?;
        Ok(image)
    }

    async fn start(&self, spec: &StartSpec) -> Result<RuntimeHandle> {
        let mut container = Container::new(self.builder.client(), spec.image.clone())
            .with_name(spec.name.clone())
            .env(spec.env.clone())
            .config_override(build_docker_config(spec));

        container.start(false).await.map_err(|err| {
            WorkspaceError::ProvisionFailure(format!(
                "Failed to start workspace container {}: {err}",
                spec.name
            ))
        })?;

        let id = container
            .id()
            .ok_or_else(|| WorkspaceError::Docker("Missing container id".into()))?
            .to_string();
        info!("docker: started container {} ({id})", spec.name);
        Ok(RuntimeHandle::new(id, spec.name.clone(), spec.port))
    }

    async fn inspect_address(&self, handle: &RuntimeHandle) -> Result<Option<String>> {
        let inspect = self
            .builder
            .client()
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| WorkspaceError::Docker(format!("Failed to inspect container: {err}")))?;

        if !is_running(&inspect) {
            return Ok(None);
        }

        let address = match self.settings.address_mode {
            AddressMode::Network => network_ip(&inspect, &self.settings.network)
                .map(|ip| format!("{ip}:{}", handle.port)),
            AddressMode::Published => inspect
                .network_settings
                .as_ref()
                .and_then(|settings| settings.ports.as_ref())
                .and_then(|ports| extract_host_port(ports, handle.port))
                .map(|port| format!("{}:{port}", self.settings.public_host)),
        };
        Ok(address)
    }

    async fn stop(&self, handle: &RuntimeHandle, grace_secs: u64) -> Result<()> {
        let result = self
            .builder
            .client()
            .stop_container(
                &handle.id,
                Some(StopContainerOptions {
                    t: grace_secs as i64,
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_already_gone(&err) => {
                debug!("docker: container {} already stopped", handle.name);
                Ok(())
            }
            Err(err) => Err(WorkspaceError::TeardownFailure(format!(
                "Failed to stop container {}: {err}",
                handle.name
            ))),
        }
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
        let result = self
            .builder
            .client()
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_already_gone(&err) || is_removal_in_progress(&err) => {
                debug!("docker: container {} already removed", handle.name);
                Ok(())
            }
            Err(err) => Err(WorkspaceError::TeardownFailure(format!(
                "Failed to remove container {}: {err}",
                handle.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docktopus::bollard::models::{ContainerState, EndpointSettings, NetworkSettings};

    fn spec() -> StartSpec {
        StartSpec {
            name: "ab12cd34ef".into(),
            image: "code-server:latest".into(),
            cmd: vec!["--allow-http".into()],
            env: vec!["WORKSPACE_PORT=8443".into()],
            memory_mb: 1024,
            storage_quota: Some("5G".into()),
            binds: vec!["/srv/users/42:/root/project".into()],
            port: 8443,
        }
    }

    #[test]
    fn build_context_is_archived_with_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3-slim\n").unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();

        let tarball = context_tarball(dir.path()).unwrap();
        let mut archive = tar::Archive::new(tarball.as_slice());
        let paths: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().into_owned())
            .collect();
        assert!(paths.iter().any(|p| p.ends_with("Dockerfile")));
        assert!(paths.iter().any(|p| p.ends_with("app.py")));
    }

    #[test]
    fn missing_build_context_is_a_docker_error() {
        let err = context_tarball(Path::new("/nonexistent/build/context")).unwrap_err();
        assert_eq!(err.kind(), "docker");
    }

    #[test]
    fn docker_config_carries_limits_and_mounts() {
        let config = build_docker_config(&spec());
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(
            host.storage_opt.unwrap().get("size").map(String::as_str),
            Some("5G")
        );
        assert_eq!(host.binds.unwrap(), vec!["/srv/users/42:/root/project"]);
        assert!(host.port_bindings.unwrap().contains_key("8443/tcp"));
        assert_eq!(config.cmd.unwrap(), vec!["--allow-http"]);
    }

    #[test]
    fn unlimited_memory_and_no_quota_are_omitted() {
        let mut spec = spec();
        spec.memory_mb = 0;
        spec.storage_quota = None;
        spec.cmd.clear();
        let config = build_docker_config(&spec);
        let host = config.host_config.unwrap();
        assert!(host.memory.is_none());
        assert!(host.storage_opt.is_none());
        assert!(config.cmd.is_none());
    }

    #[test]
    fn network_ip_reads_named_network() {
        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.4".into()),
                ..Default::default()
            },
        );
        let inspect = ContainerInspectResponse {
            state: Some(ContainerState {
                running: Some(true),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(is_running(&inspect));
        assert_eq!(network_ip(&inspect, "bridge").as_deref(), Some("172.17.0.4"));
        assert_eq!(network_ip(&inspect, "other"), None);
    }

    #[test]
    fn host_port_extraction() {
        let mut ports = HashMap::new();
        ports.insert(
            "8443/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("49153".into()),
            }]),
        );
        assert_eq!(extract_host_port(&ports, 8443), Some(49153));
        assert_eq!(extract_host_port(&ports, 22), None);
    }

    #[test]
    fn gone_and_in_progress_errors_are_tolerated() {
        let gone = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        let busy = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "removal of container w1 is already in progress".into(),
        };
        let other = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(is_already_gone(&gone));
        assert!(is_removal_in_progress(&busy));
        assert!(!is_already_gone(&other));
        assert!(!is_removal_in_progress(&other));
    }
}
