//! Runner for workspace-gate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use workspace_runtime::front::{FrontState, front_router};
use workspace_runtime::identity::{GithubGate, IdentitySessions};
use workspace_runtime::operator_api::{OperatorState, operator_api_router};
use workspace_runtime::probe::HttpProbe;
use workspace_runtime::docker::DockerRuntime;
use workspace_runtime::{GatewayConfig, Lifecycle, Registry, ShutdownCoordinator, WorkspaceError};

#[tokio::main]
async fn main() -> Result<(), WorkspaceError> {
    setup_log();

    let config = Arc::new(GatewayConfig::load()?);
    info!(
        "Starting workspace-gate (proxy port {}, admin port {}, routing {:?})",
        config.proxy_port, config.admin_port, config.routing
    );

    let runtime = Arc::new(DockerRuntime::connect(config.docker.clone()).await?);
    let registry = Arc::new(Registry::new());
    let lifecycle = Lifecycle::new(
        registry.clone(),
        runtime,
        Arc::new(HttpProbe::default()),
        config.clone(),
    );

    lifecycle.prepare_images().await?;
    let sessions = Arc::new(IdentitySessions::new(config.identity_session_ttl_secs));

    if config.reaper_interval_secs > 0 {
        workspace_runtime::reaper::spawn_reaper(
            lifecycle.clone(),
            sessions.clone(),
            Duration::from_secs(config.reaper_interval_secs),
        );
    }

    let coordinator = Arc::new(ShutdownCoordinator::new(
        lifecycle.clone(),
        config.shutdown_deadline(),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);

    // Operator API
    {
        let router = operator_api_router(OperatorState::new(registry.clone(), &config.admin_token));
        let addr = SocketAddr::from(([0, 0, 0, 0], config.admin_port));
        let listener = bind(addr).await?;
        info!("Starting operator API on {addr}");
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(wait_for_stop(stop))
                .await
            {
                error!("Operator API error: {e}");
            }
        });
    }

    // Public front
    {
        let state = FrontState::new(
            lifecycle.clone(),
            Arc::new(GithubGate::new(config.github.clone())),
            sessions.clone(),
            coordinator.clone(),
        );
        let router = front_router(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
        let listener = bind(addr).await?;
        info!("Starting workspace front on {addr}");
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(wait_for_stop(stop))
                .await
            {
                error!("Front error: {e}");
            }
        });
    }

    termination_signal().await;
    info!("Termination requested, draining workspaces");
    let _ = stop_tx.send(true);

    // A second signal joins the running drain.
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            loop {
                termination_signal().await;
                warn!("Shutdown already in progress");
                coordinator.shutdown().await;
            }
        });
    }

    let report = coordinator.shutdown().await;
    if report.timed_out {
        error!(
            "Shutdown deadline passed with {} workspace(s) not confirmed removed",
            report.remaining
        );
    }
    info!("workspace-gate stopped ({} workspace(s) destroyed)", report.destroyed);
    Ok(())
}

async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener, WorkspaceError> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| WorkspaceError::Config(format!("Failed to bind {addr}: {e}")))
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
