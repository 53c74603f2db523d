//! Container runtime contract.
//!
//! The lifecycle manager only talks to containers through [`ContainerRuntime`].
//! The production implementation is [`crate::docker::DockerRuntime`]; tests use
//! [`mock::MockRuntime`].

use serde::Serialize;

use crate::config::ImageProfile;
use crate::error::Result;

/// Identifies a started container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeHandle {
    /// Runtime-assigned container id.
    pub id: String,
    /// Container name (the workspace id).
    pub name: String,
    /// Port the workspace service listens on inside the container.
    pub port: u16,
}

impl RuntimeHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            port,
        }
    }

    /// Handle addressing the container by name only, for teardown when the
    /// provisioning task never recorded an id.
    pub fn from_name(name: &str, port: u16) -> Self {
        Self::new(name, name, port)
    }
}

/// Everything needed to start one workspace container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub memory_mb: u64,
    pub storage_quota: Option<String>,
    /// `host_path:container_path` bind mounts.
    pub binds: Vec<String>,
    pub port: u16,
}

impl StartSpec {
    /// Expand a profile for one workspace. `{secret}` in the command is
    /// replaced with the access secret.
    pub fn from_profile(
        profile: &ImageProfile,
        name: &str,
        secret: &str,
        host_storage: &str,
    ) -> Self {
        let cmd = profile
            .cmd
            .iter()
            .map(|arg| arg.replace("{secret}", secret))
            .collect();
        let mut env = vec![format!("WORKSPACE_PORT={}", profile.port)];
        if let Some(var) = &profile.secret_env {
            env.push(format!("{var}={secret}"));
        }
        Self {
            name: name.to_string(),
            image: profile.image.clone(),
            cmd,
            env,
            memory_mb: profile.memory_mb,
            storage_quota: profile.storage_quota.clone(),
            binds: vec![format!("{host_storage}:{}", profile.bind_target)],
            port: profile.port,
        }
    }
}

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make the profile's image available locally. Returns the image reference.
    async fn build(&self, profile: &ImageProfile) -> Result<String>;

    async fn start(&self, spec: &StartSpec) -> Result<RuntimeHandle>;

    /// The container's reachable `host:port`, or `None` while it has no
    /// network identity yet.
    async fn inspect_address(&self, handle: &RuntimeHandle) -> Result<Option<String>>;

    /// Stop the container. An already stopped or missing container is success.
    async fn stop(&self, handle: &RuntimeHandle, grace_secs: u64) -> Result<()>;

    /// Remove the container. A missing container is success.
    async fn remove(&self, handle: &RuntimeHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Mock runtime for tests
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::error::WorkspaceError;
    use std::sync::{Mutex, PoisonError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A configurable in-memory container runtime.
    ///
    /// Tracks call counts via atomics. By default every container gets
    /// `address` on the first inspection. `address_after` delays the address
    /// by that many inspections; `no_address()` never reports one.
    pub struct MockRuntime {
        pub build_count: AtomicUsize,
        pub start_count: AtomicUsize,
        pub inspect_count: AtomicUsize,
        pub stop_count: AtomicUsize,
        pub remove_count: AtomicUsize,
        pub fail_start: AtomicBool,
        pub fail_remove: AtomicBool,
        pub address_after: AtomicUsize,
        address: Mutex<Option<String>>,
        started: Mutex<Vec<StartSpec>>,
        removed: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        pub fn new(address: &str) -> Self {
            Self {
                build_count: AtomicUsize::new(0),
                start_count: AtomicUsize::new(0),
                inspect_count: AtomicUsize::new(0),
                stop_count: AtomicUsize::new(0),
                remove_count: AtomicUsize::new(0),
                fail_start: AtomicBool::new(false),
                fail_remove: AtomicBool::new(false),
                address_after: AtomicUsize::new(0),
                address: Mutex::new(Some(address.to_string())),
                started: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            let mock = Self::new("127.0.0.1:1");
            mock.fail_start.store(true, Ordering::Relaxed);
            mock
        }

        pub fn no_address() -> Self {
            let mock = Self::new("unused");
            mock.set_address(None);
            mock
        }

        pub fn set_address(&self, address: Option<&str>) {
            *self.address.lock().unwrap_or_else(PoisonError::into_inner) = address.map(str::to_string);
        }

        pub fn started(&self) -> Vec<StartSpec> {
            self.started.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        /// Names of removed containers, in removal order.
        pub fn removed(&self) -> Vec<String> {
            self.removed.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn build(&self, profile: &ImageProfile) -> Result<String> {
            self.build_count.fetch_add(1, Ordering::SeqCst);
            Ok(profile.image.clone())
        }

        async fn start(&self, spec: &StartSpec) -> Result<RuntimeHandle> {
            self.start_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(WorkspaceError::Docker("Mock start failure".into()));
            }
            self.started.lock().unwrap_or_else(PoisonError::into_inner).push(spec.clone());
            Ok(RuntimeHandle::new(
                format!("mock-{}", spec.name),
                spec.name.clone(),
                spec.port,
            ))
        }

        async fn inspect_address(&self, _handle: &RuntimeHandle) -> Result<Option<String>> {
            let seen = self.inspect_count.fetch_add(1, Ordering::SeqCst);
            if seen < self.address_after.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(self.address.lock().unwrap_or_else(PoisonError::into_inner).clone())
        }

        async fn stop(&self, _handle: &RuntimeHandle, _grace_secs: u64) -> Result<()> {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
            self.remove_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(WorkspaceError::Docker("Mock remove failure".into()));
            }
            self.removed.lock().unwrap_or_else(PoisonError::into_inner).push(handle.name.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_spec_substitutes_secret_and_binds_storage() {
        let profile = ImageProfile {
            image: "code-server:latest".into(),
            memory_mb: 512,
            storage_quota: Some("10G".into()),
            cmd: vec!["--allow-http".into(), "--password".into(), "{secret}".into()],
            secret_env: Some("PASSWORD".into()),
            ..Default::default()
        };
        let spec = StartSpec::from_profile(&profile, "ab12cd34ef", "s3cr3t", "/srv/users/42");

        assert_eq!(spec.name, "ab12cd34ef");
        assert_eq!(spec.cmd, vec!["--allow-http", "--password", "s3cr3t"]);
        assert!(spec.env.contains(&"PASSWORD=s3cr3t".to_string()));
        assert_eq!(spec.binds, vec!["/srv/users/42:/root/project"]);
        assert_eq!(spec.storage_quota.as_deref(), Some("10G"));
        assert_eq!(spec.port, 8443);
    }

    #[tokio::test]
    async fn mock_delays_address() {
        let mock = mock::MockRuntime::new("10.0.0.5:8443");
        mock.address_after
            .store(2, std::sync::atomic::Ordering::SeqCst);
        let handle = RuntimeHandle::from_name("w1", 8443);
        assert_eq!(mock.inspect_address(&handle).await.unwrap(), None);
        assert_eq!(mock.inspect_address(&handle).await.unwrap(), None);
        assert_eq!(
            mock.inspect_address(&handle).await.unwrap().as_deref(),
            Some("10.0.0.5:8443")
        );
    }
}
