use std::fmt;

/// Errors returned by workspace lifecycle and routing operations.
#[derive(Debug)]
pub enum WorkspaceError {
    /// The runtime refused to start the workspace (or its storage could not be prepared).
    ProvisionFailure(String),
    /// Address discovery or readiness did not complete before the deadline.
    ProvisionTimeout(String),
    /// A newer login for the same user replaced this workspace while it was provisioning.
    Superseded(String),
    /// The process is shutting down and accepts no new workspaces.
    Draining(String),
    /// Stop/remove failed for a reason other than the container already being gone.
    TeardownFailure(String),
    /// Forwarding to the workspace backend failed.
    BackendUnreachable(String),
    /// Docker/container runtime failure.
    Docker(String),
    /// Identity gate failure (OAuth exchange, unknown session).
    Auth(String),
    /// Outbound HTTP request failed.
    Http(String),
    /// Invalid or unreadable configuration.
    Config(String),
    /// Invalid input.
    Validation(String),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::ProvisionFailure(msg) => write!(f, "provision failure: {msg}"),
            WorkspaceError::ProvisionTimeout(msg) => write!(f, "provision timeout: {msg}"),
            WorkspaceError::Superseded(msg) => write!(f, "workspace superseded: {msg}"),
            WorkspaceError::Draining(msg) => write!(f, "draining: {msg}"),
            WorkspaceError::TeardownFailure(msg) => write!(f, "teardown failure: {msg}"),
            WorkspaceError::BackendUnreachable(msg) => write!(f, "backend unreachable: {msg}"),
            WorkspaceError::Docker(msg) => write!(f, "docker error: {msg}"),
            WorkspaceError::Auth(msg) => write!(f, "auth error: {msg}"),
            WorkspaceError::Http(msg) => write!(f, "http error: {msg}"),
            WorkspaceError::Config(msg) => write!(f, "config error: {msg}"),
            WorkspaceError::Validation(msg) => write!(f, "validation error: {msg}"),
        }
    }
}

impl std::error::Error for WorkspaceError {}

impl WorkspaceError {
    /// Short machine-readable kind, used in logs and the login failure view.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkspaceError::ProvisionFailure(_) => "provision_failure",
            WorkspaceError::ProvisionTimeout(_) => "provision_timeout",
            WorkspaceError::Superseded(_) => "superseded",
            WorkspaceError::Draining(_) => "draining",
            WorkspaceError::TeardownFailure(_) => "teardown_failure",
            WorkspaceError::BackendUnreachable(_) => "backend_unreachable",
            WorkspaceError::Docker(_) => "docker",
            WorkspaceError::Auth(_) => "auth",
            WorkspaceError::Http(_) => "http",
            WorkspaceError::Config(_) => "config",
            WorkspaceError::Validation(_) => "validation",
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;
