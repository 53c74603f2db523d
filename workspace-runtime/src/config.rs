//! Gateway configuration.
//!
//! Loaded from a JSON settings file (`WORKSPACE_GATE_SETTINGS`, default
//! `settings.json`), then individual keys are overridden from environment
//! variables. A missing settings file yields the defaults.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkspaceError};
use crate::{DEFAULT_ADMIN_PORT, DEFAULT_PROXY_PORT, DEFAULT_WORKSPACE_IMAGE, DEFAULT_WORKSPACE_PORT};

pub const SETTINGS_ENV: &str = "WORKSPACE_GATE_SETTINGS";

/// How proxied requests are mapped onto a workspace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// The whole origin belongs to the session's workspace; paths are forwarded unchanged.
    #[default]
    Host,
    /// Workspaces live under `/{workspace_id}/`; the prefix is stripped before forwarding.
    Path,
}

impl RoutingStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" => Some(Self::Host),
            "path" => Some(Self::Path),
            _ => None,
        }
    }
}

/// Where the workspace's network address comes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// Container IP on the configured docker network plus the profile port.
    #[default]
    Network,
    /// `public_host` plus the host port docker published for the profile port.
    Published,
}

/// Resource limits and mounts for one kind of workspace image.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageProfile {
    pub image: String,
    /// Memory limit in MB. `0` means unlimited.
    pub memory_mb: u64,
    /// Writable-layer size limit passed as the `size` storage option (e.g. `"10G"`).
    pub storage_quota: Option<String>,
    /// Host directory holding one private sub-directory per user.
    pub storage_root: PathBuf,
    /// Mount point of the user's directory inside the container.
    pub bind_target: String,
    /// Port the workspace service listens on inside the container.
    pub port: u16,
    /// Container command. `{secret}` is replaced with the workspace access secret.
    pub cmd: Vec<String>,
    /// If set, the access secret is also exported under this env var.
    pub secret_env: Option<String>,
    pub stop_grace_secs: u64,
    /// Directory holding a Dockerfile. When set, `image` is built from it
    /// instead of pulled.
    pub build_context: Option<PathBuf>,
    /// Dockerfile path relative to `build_context`.
    pub dockerfile: String,
}

impl Default for ImageProfile {
    fn default() -> Self {
        Self {
            image: DEFAULT_WORKSPACE_IMAGE.to_string(),
            memory_mb: 0,
            storage_quota: None,
            storage_root: PathBuf::from("users"),
            bind_target: "/root/project".to_string(),
            port: DEFAULT_WORKSPACE_PORT,
            cmd: Vec::new(),
            secret_env: None,
            stop_grace_secs: 5,
            build_context: None,
            dockerfile: "Dockerfile".to_string(),
        }
    }
}

/// Bounded polling policy for address discovery and readiness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub deadline_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            deadline_secs: 60,
        }
    }
}

impl RetryPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    pub docker_host: Option<String>,
    pub network: String,
    pub address_mode: AddressMode,
    pub public_host: String,
    pub pull_image: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            docker_host: None,
            network: "bridge".to_string(),
            address_mode: AddressMode::Network,
            public_host: "127.0.0.1".to_string(),
            pull_image: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSettings {
    pub client_id: String,
    pub client_secret: String,
    pub callback_url: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_url: String,
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            callback_url: format!("http://localhost:{DEFAULT_PROXY_PORT}/auth/callback"),
            authorize_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            api_url: "https://api.github.com".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub proxy_port: u16,
    pub admin_port: u16,
    pub idle_timeout_secs: u64,
    /// `0` disables the interval reaper; sweeps then only run before logins.
    pub reaper_interval_secs: u64,
    pub shutdown_deadline_secs: u64,
    /// Lifetime of an identity session (the signed-in browser), in seconds.
    pub identity_session_ttl_secs: u64,
    pub deny_list: HashSet<String>,
    pub routing: RoutingStrategy,
    pub profiles: HashMap<String, ImageProfile>,
    pub default_profile: String,
    pub user_profiles: HashMap<String, String>,
    pub provision: RetryPolicy,
    pub docker: DockerSettings,
    pub github: GithubSettings,
    pub cookie_secure: bool,
    /// Bearer token for the operator API. Empty disables the authenticated endpoints.
    pub admin_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), ImageProfile::default());
        Self {
            proxy_port: DEFAULT_PROXY_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            idle_timeout_secs: 3600,
            reaper_interval_secs: 60,
            shutdown_deadline_secs: 30,
            identity_session_ttl_secs: 86_400,
            deny_list: HashSet::new(),
            routing: RoutingStrategy::Host,
            profiles,
            default_profile: "default".to_string(),
            user_profiles: HashMap::new(),
            provision: RetryPolicy::default(),
            docker: DockerSettings::default(),
            github: GithubSettings::default(),
            cookie_secure: false,
            admin_token: String::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from the settings file named by `WORKSPACE_GATE_SETTINGS`, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = env::var(SETTINGS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("settings.json"));
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            WorkspaceError::Config(format!("Failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| WorkspaceError::Config(format!("Invalid settings JSON: {err}")))
    }

    fn apply_env(&mut self) {
        if let Some(port) = env::var("PROXY_PORT").ok().and_then(|v| v.parse::<u16>().ok()) {
            self.proxy_port = port;
        }
        if let Some(port) = env::var("ADMIN_PORT").ok().and_then(|v| v.parse::<u16>().ok()) {
            self.admin_port = port;
        }
        if let Some(secs) = env::var("IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.idle_timeout_secs = secs;
        }
        if let Some(secs) = env::var("REAPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.reaper_interval_secs = secs;
        }
        if let Some(routing) = env::var("ROUTING_STRATEGY")
            .ok()
            .and_then(|v| RoutingStrategy::parse(&v))
        {
            self.routing = routing;
        }
        if let Ok(host) = env::var("DOCKER_HOST") {
            self.docker.docker_host = Some(host);
        }
        if let Ok(id) = env::var("GITHUB_CLIENT_ID") {
            self.github.client_id = id;
        }
        if let Ok(secret) = env::var("GITHUB_CLIENT_SECRET") {
            self.github.client_secret = secret;
        }
        if let Ok(url) = env::var("GITHUB_CALLBACK_URL") {
            self.github.callback_url = url;
        }
        if let Ok(token) = env::var("ADMIN_TOKEN") {
            self.admin_token = token;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.profiles.contains_key(&self.default_profile) {
            return Err(WorkspaceError::Config(format!(
                "default_profile '{}' is not defined in profiles",
                self.default_profile
            )));
        }
        for (user, profile) in &self.user_profiles {
            if !self.profiles.contains_key(profile) {
                return Err(WorkspaceError::Config(format!(
                    "user '{user}' is mapped to unknown profile '{profile}'"
                )));
            }
        }
        Ok(())
    }

    pub fn is_denied(&self, user_id: &str) -> bool {
        self.deny_list.contains(user_id)
    }

    /// Profile name for a user: the per-user mapping, else the global default.
    pub fn profile_name_for(&self, user_id: &str) -> &str {
        self.user_profiles
            .get(user_id)
            .map(String::as_str)
            .unwrap_or(&self.default_profile)
    }

    pub fn profile(&self, name: &str) -> Option<&ImageProfile> {
        self.profiles.get(name)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.profile_name_for("anyone"), "default");
        assert_eq!(config.routing, RoutingStrategy::Host);
    }

    #[test]
    fn per_user_profiles_from_json() {
        let raw = r#"{
            "idle_timeout_secs": 900,
            "deny_list": ["666"],
            "routing": "path",
            "profiles": {
                "code": { "image": "code-server:latest", "memory_mb": 2048, "port": 8443,
                          "cmd": ["--allow-http", "--password", "{secret}"] },
                "terminado": { "image": "terminado:latest", "port": 8765 }
            },
            "default_profile": "code",
            "user_profiles": { "42": "terminado" }
        }"#;
        let config = GatewayConfig::from_json(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.idle_timeout_secs, 900);
        assert!(config.is_denied("666"));
        assert!(!config.is_denied("42"));
        assert_eq!(config.routing, RoutingStrategy::Path);
        assert_eq!(config.profile_name_for("42"), "terminado");
        assert_eq!(config.profile_name_for("7"), "code");
        let code = config.profile("code").unwrap();
        assert_eq!(code.memory_mb, 2048);
        assert_eq!(code.bind_target, "/root/project");
        assert_eq!(config.provision, RetryPolicy::default());
    }

    #[test]
    fn example_settings_parse() {
        let config =
            GatewayConfig::from_json(include_str!("../../settings.example.json")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.profile_name_for("anyone"), "code");
        let terminado = config.profile("terminado").unwrap();
        assert_eq!(terminado.port, 8765);
        assert_eq!(
            terminado.build_context.as_deref(),
            Some(Path::new("images/terminado"))
        );
        assert_eq!(terminado.dockerfile, "Dockerfile");
        assert!(config.profile("code").unwrap().build_context.is_none());
        assert_eq!(config.docker.address_mode, AddressMode::Network);
    }

    #[test]
    fn unknown_default_profile_rejected() {
        let raw = r#"{ "default_profile": "missing" }"#;
        let config = GatewayConfig::from_json(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn user_mapped_to_unknown_profile_rejected() {
        let raw = r#"{ "user_profiles": { "1": "nope" } }"#;
        let config = GatewayConfig::from_json(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn routing_strategy_parse() {
        assert_eq!(RoutingStrategy::parse("PATH"), Some(RoutingStrategy::Path));
        assert_eq!(RoutingStrategy::parse(" host "), Some(RoutingStrategy::Host));
        assert_eq!(RoutingStrategy::parse("dns"), None);
    }
}
