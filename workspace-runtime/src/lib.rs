//! Per-user container workspaces behind a session-gated reverse proxy.
//!
//! This crate provides the workspace registry and routing table, the
//! lifecycle manager that provisions and tears down containers, the idle
//! reaper, the shutdown coordinator, and the HTTP front that forwards
//! authenticated traffic to each user's workspace.

pub mod config;
pub mod docker;
pub mod error;
pub mod front;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod operator_api;
pub mod probe;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod shutdown;
pub mod util;
pub mod views;

pub use config::{GatewayConfig, ImageProfile, RetryPolicy, RoutingStrategy};
pub use error::{Result, WorkspaceError};
pub use lifecycle::Lifecycle;
pub use registry::{Registry, Workspace, WorkspaceState};
pub use runtime::{ContainerRuntime, RuntimeHandle, StartSpec};
pub use shutdown::ShutdownCoordinator;

pub const DEFAULT_WORKSPACE_IMAGE: &str = "codercom/code-server:latest";
pub const DEFAULT_WORKSPACE_PORT: u16 = 8443;
pub const DEFAULT_PROXY_PORT: u16 = 8080;
pub const DEFAULT_ADMIN_PORT: u16 = 9090;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Cookie carrying the workspace session token.
pub const SESSION_COOKIE: &str = "workspace_session";
/// Cookie carrying the identity session id.
pub const IDENTITY_COOKIE: &str = "gate_session";
/// Cookie carrying the OAuth `state` value between `/login` and the callback.
pub const OAUTH_STATE_COOKIE: &str = "oauth_state";
