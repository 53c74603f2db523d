//! Workspace provisioning and teardown.
//!
//! Every state change goes through the [`Registry`] first, so a workspace
//! stops being routable before its container is touched. Provisioning runs
//! in its own task: a dropped login request never strands a half-started
//! container.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, ImageProfile};
use crate::error::{Result, WorkspaceError};
use crate::metrics::metrics;
use crate::probe::ReadinessProbe;
use crate::registry::{Registry, Teardown, Workspace, WorkspaceState};
use crate::retry::{Attempt, RetryOutcome, poll_with_backoff};
use crate::runtime::{ContainerRuntime, RuntimeHandle, StartSpec};
use crate::util::{generate_token, is_path_safe};

/// A Ready workspace together with the session token that routes to it.
#[derive(Clone, Debug)]
pub struct ReadySession {
    pub token: String,
    pub workspace: Workspace,
}

#[derive(Clone)]
pub struct Lifecycle {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    config: Arc<GatewayConfig>,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            registry,
            runtime,
            probe,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    /// Make every configured profile's image available. Called once at startup.
    pub async fn prepare_images(&self) -> Result<()> {
        for (name, profile) in &self.config.profiles {
            let image = self.runtime.build(profile).await?;
            info!("lifecycle: profile {name} uses image {image}");
        }
        Ok(())
    }

    /// Provision a workspace for `user_id`, superseding any existing one.
    pub async fn create(&self, user_id: &str, profile_name: &str) -> Result<ReadySession> {
        let this = self.clone();
        let user_id = user_id.to_string();
        let profile_name = profile_name.to_string();
        tokio::spawn(async move { this.provision(&user_id, &profile_name).await })
            .await
            .map_err(|err| {
                WorkspaceError::ProvisionFailure(format!("provisioning task failed: {err}"))
            })?
    }

    async fn provision(&self, user_id: &str, profile_name: &str) -> Result<ReadySession> {
        if !is_path_safe(user_id) {
            metrics().record_provision_failure();
            return Err(WorkspaceError::ProvisionFailure(format!(
                "user id {user_id:?} cannot be used as a storage path"
            )));
        }
        let profile = self.config.profile(profile_name).cloned().ok_or_else(|| {
            WorkspaceError::Config(format!("unknown workspace profile '{profile_name}'"))
        })?;

        let issued = self.registry.issue(user_id, profile_name)?;
        let workspace_id = issued.workspace_id;
        if let Some(old) = issued.superseded {
            metrics().record_superseded();
            let this = self.clone();
            tokio::spawn(async move {
                this.destroy(&old.id).await;
            });
        }
        info!("lifecycle: provisioning workspace {workspace_id} for user {user_id} ({profile_name})");

        match self.start_and_wait(user_id, &workspace_id, &profile).await {
            Ok(address) => match self.registry.bind_ready(&workspace_id, &address) {
                Ok(workspace) => {
                    metrics().record_ready();
                    info!(
                        "lifecycle: workspace {workspace_id} for user {user_id} ready at {address}"
                    );
                    Ok(ReadySession {
                        token: issued.token,
                        workspace,
                    })
                }
                Err(err) => self.abandon(&workspace_id, err).await,
            },
            Err(err) => self.abandon(&workspace_id, err).await,
        }
    }

    /// Storage, container start, address discovery and readiness. Returns the address.
    async fn start_and_wait(
        &self,
        user_id: &str,
        workspace_id: &str,
        profile: &ImageProfile,
    ) -> Result<String> {
        let storage = prepare_storage(profile, user_id).await?;

        let secret = generate_token();
        let spec = StartSpec::from_profile(profile, workspace_id, &secret, &storage);
        let handle = self.runtime.start(&spec).await.map_err(|err| match err {
            WorkspaceError::ProvisionFailure(_) => err,
            other => WorkspaceError::ProvisionFailure(other.to_string()),
        })?;
        self.registry.attach_handle(workspace_id, handle.clone());

        let policy = &self.config.provision;
        let outcome = poll_with_backoff(policy, |attempt| {
            let registry = self.registry.clone();
            let runtime = self.runtime.clone();
            let handle = handle.clone();
            let workspace_id = workspace_id.to_string();
            async move {
                if !registry.is_current(&workspace_id) {
                    return Attempt::Abort;
                }
                match runtime.inspect_address(&handle).await {
                    Ok(Some(address)) => Attempt::Ready(address),
                    Ok(None) => Attempt::Pending,
                    Err(err) => {
                        debug!("lifecycle: inspect {workspace_id} attempt {attempt}: {err}");
                        Attempt::Pending
                    }
                }
            }
        })
        .await;
        let address = match outcome {
            RetryOutcome::Ready(address) => address,
            RetryOutcome::TimedOut { attempts } => {
                return Err(WorkspaceError::ProvisionTimeout(format!(
                    "workspace {workspace_id} reported no address after {attempts} attempts"
                )));
            }
            RetryOutcome::Aborted => return Err(superseded(workspace_id)),
        };

        let outcome = poll_with_backoff(policy, |_| {
            let registry = self.registry.clone();
            let probe = self.probe.clone();
            let address = address.clone();
            let workspace_id = workspace_id.to_string();
            async move {
                if !registry.is_current(&workspace_id) {
                    return Attempt::Abort;
                }
                if probe.probe(&address).await {
                    Attempt::Ready(())
                } else {
                    Attempt::Pending
                }
            }
        })
        .await;
        match outcome {
            RetryOutcome::Ready(()) => Ok(address),
            RetryOutcome::TimedOut { attempts } => Err(WorkspaceError::ProvisionTimeout(format!(
                "workspace {workspace_id} at {address} not ready after {attempts} probes"
            ))),
            RetryOutcome::Aborted => Err(superseded(workspace_id)),
        }
    }

    /// Provisioning failed or lost to a newer login: tear down, then report.
    async fn abandon(&self, workspace_id: &str, err: WorkspaceError) -> Result<ReadySession> {
        match &err {
            WorkspaceError::ProvisionTimeout(_) => metrics().record_provision_timeout(),
            WorkspaceError::Superseded(_) => {}
            _ => metrics().record_provision_failure(),
        }
        warn!("lifecycle: workspace {workspace_id} abandoned: {err}");
        self.registry.end_provisioning(workspace_id);
        self.destroy(workspace_id).await;
        Err(err)
    }

    /// Stop routing to the workspace, remove its container, purge its records.
    ///
    /// Returns the final record (state `Gone`) when this call performed the
    /// teardown, `None` when there was nothing to claim.
    pub async fn destroy(&self, workspace_id: &str) -> Option<Workspace> {
        let (mut workspace, handle) = match self.registry.mark_destroying(workspace_id) {
            Teardown::Claimed { workspace, handle } => (workspace, handle),
            Teardown::Deferred => {
                debug!("lifecycle: workspace {workspace_id} still provisioning; teardown deferred");
                return None;
            }
            Teardown::Absent => return None,
        };

        let profile = self.config.profile(&workspace.profile);
        let port = profile.map(|p| p.port).unwrap_or(crate::DEFAULT_WORKSPACE_PORT);
        let grace = profile.map(|p| p.stop_grace_secs).unwrap_or(5);
        let handle = handle.unwrap_or_else(|| RuntimeHandle::from_name(&workspace.id, port));

        info!(
            "lifecycle: destroying workspace {workspace_id} of user {}",
            workspace.owner
        );
        if let Err(err) = self.runtime.stop(&handle, grace).await {
            warn!("lifecycle: stop of workspace {workspace_id} failed: {err}");
        }
        if let Err(err) = self.runtime.remove(&handle).await {
            metrics().record_teardown_failure();
            error!(
                "lifecycle: abandoning container of workspace {workspace_id} (user {}): {err}",
                workspace.owner
            );
        }

        self.registry.purge(workspace_id);
        if workspace.address.is_some() {
            metrics().record_released();
        }
        metrics().record_destroyed();
        workspace.state = WorkspaceState::Gone;
        info!("lifecycle: workspace {workspace_id} gone");
        Some(workspace)
    }
}

fn superseded(workspace_id: &str) -> WorkspaceError {
    WorkspaceError::Superseded(format!(
        "workspace {workspace_id} was replaced by a newer login"
    ))
}

/// Create the user's private storage directory. Returns its absolute host path.
async fn prepare_storage(profile: &ImageProfile, user_id: &str) -> Result<String> {
    let dir: PathBuf = profile.storage_root.join(user_id);
    tokio::fs::create_dir_all(&dir).await.map_err(|err| {
        WorkspaceError::ProvisionFailure(format!(
            "Failed to create storage {}: {err}",
            dir.display()
        ))
    })?;
    let absolute = tokio::fs::canonicalize(&dir).await.map_err(|err| {
        WorkspaceError::ProvisionFailure(format!(
            "Failed to resolve storage {}: {err}",
            dir.display()
        ))
    })?;
    Ok(absolute.to_string_lossy().into_owned())
}
