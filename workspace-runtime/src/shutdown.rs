//! Drains every workspace before the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::lifecycle::Lifecycle;

const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Workspaces torn down by the drain itself.
    pub destroyed: usize,
    /// Records still present when the drain returned.
    pub remaining: usize,
    pub timed_out: bool,
}

pub struct ShutdownCoordinator {
    lifecycle: Lifecycle,
    deadline: Duration,
    draining: AtomicBool,
    drained: OnceCell<DrainReport>,
}

impl ShutdownCoordinator {
    pub fn new(lifecycle: Lifecycle, deadline: Duration) -> Self {
        Self {
            lifecycle,
            deadline,
            draining: AtomicBool::new(false),
            drained: OnceCell::new(),
        }
    }

    /// True once a drain has started. New logins are refused from then on.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Drain all workspaces. Later or concurrent calls wait for the first
    /// drain and return its report.
    pub async fn shutdown(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            info!("shutdown: drain already in progress");
        }
        self.drained.get_or_init(|| self.drain()).await.clone()
    }

    async fn drain(&self) -> DrainReport {
        let registry = self.lifecycle.registry().clone();
        // Logins that get past the front's drain check are refused by `issue`
        // from here on, so the snapshot below is complete.
        registry.close();
        let ids = registry.workspace_ids();
        info!("shutdown: draining {} workspace(s)", ids.len());

        let mut tasks = JoinSet::new();
        for workspace_id in ids {
            let lifecycle = self.lifecycle.clone();
            tasks.spawn(async move { lifecycle.destroy(&workspace_id).await.is_some() });
        }

        let mut destroyed = 0;
        let drained = tokio::time::timeout(self.deadline, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(true) => destroyed += 1,
                    Ok(false) => {}
                    Err(err) => error!("shutdown: destroy task failed: {err}"),
                }
            }
            // Workspaces still provisioning tear themselves down.
            while !registry.is_empty() {
                tokio::time::sleep(EMPTY_POLL_INTERVAL).await;
            }
        })
        .await;

        let remaining = registry.len();
        let timed_out = drained.is_err();
        if timed_out {
            warn!(
                "shutdown: deadline of {}s passed with {remaining} workspace(s) left",
                self.deadline.as_secs()
            );
        } else {
            info!("shutdown: drained, {destroyed} workspace(s) destroyed");
        }
        DrainReport {
            destroyed,
            remaining,
            timed_out,
        }
    }
}
