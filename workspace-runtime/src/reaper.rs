//! Idle workspace reclamation.
//!
//! - `sweep()`: destroys Ready workspaces idle for longer than the timeout
//! - `reaper_tick()`: one sweep at the current time with the configured
//!   timeout, plus expiry of identity sessions
//! - `spawn_reaper()`: runs `reaper_tick()` on a fixed interval

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::identity::IdentitySessions;
use crate::lifecycle::Lifecycle;
use crate::metrics::metrics;

/// Destroy every Ready workspace whose last activity is more than
/// `timeout_secs` before `now`. Returns the ids this sweep tore down.
pub async fn sweep(lifecycle: &Lifecycle, now: u64, timeout_secs: u64) -> Vec<String> {
    let idle = lifecycle.registry().idle_ready(now, timeout_secs);
    let mut reaped = Vec::new();

    for workspace_id in idle {
        info!("reaper: destroying workspace {workspace_id} (idle longer than {timeout_secs}s)");
        if let Some(workspace) = lifecycle.destroy(&workspace_id).await {
            metrics().record_reaped_idle();
            info!(
                "reaper: reclaimed workspace {workspace_id} of user {}",
                workspace.owner
            );
            reaped.push(workspace_id);
        }
    }
    reaped
}

pub async fn reaper_tick(lifecycle: &Lifecycle, sessions: &IdentitySessions) {
    let timeout = lifecycle.config().idle_timeout_secs;
    let reaped = sweep(lifecycle, crate::util::now_ts(), timeout).await;
    if !reaped.is_empty() {
        debug!("reaper: sweep reclaimed {} workspace(s)", reaped.len());
    }
    let expired = sessions.gc();
    if expired > 0 {
        debug!("reaper: dropped {expired} expired identity session(s)");
    }
}

/// Run `reaper_tick` every `interval`. The first tick fires after one interval.
pub fn spawn_reaper(
    lifecycle: Lifecycle,
    sessions: Arc<IdentitySessions>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            reaper_tick(&lifecycle, &sessions).await;
        }
    })
}
