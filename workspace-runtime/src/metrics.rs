//! Process-wide workspace counters.
//!
//! Atomic counters with relaxed ordering; they are read by the operator API
//! and never used for control flow.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct WorkspaceMetrics {
    /// Workspaces that reached Ready.
    pub created: AtomicU64,
    pub provision_failures: AtomicU64,
    pub provision_timeouts: AtomicU64,
    /// Workspaces replaced by a newer login for the same user.
    pub superseded: AtomicU64,
    /// Teardowns that completed (successfully or abandoned).
    pub destroyed: AtomicU64,
    pub teardown_failures: AtomicU64,
    pub reaped_idle: AtomicU64,
    pub routed_requests: AtomicU64,
    pub backend_errors: AtomicU64,
    pub denied_requests: AtomicU64,
    pub active_workspaces: AtomicU64,
    pub peak_workspaces: AtomicU64,
}

impl Default for WorkspaceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceMetrics {
    pub const fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            provision_failures: AtomicU64::new(0),
            provision_timeouts: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
            reaped_idle: AtomicU64::new(0),
            routed_requests: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            denied_requests: AtomicU64::new(0),
            active_workspaces: AtomicU64::new(0),
            peak_workspaces: AtomicU64::new(0),
        }
    }

    pub fn record_ready(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        let current = self.active_workspaces.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_workspaces.fetch_max(current, Ordering::Relaxed);
    }

    /// A Ready workspace left service.
    pub fn record_released(&self) {
        let _ = self
            .active_workspaces
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provision_timeout(&self) {
        self.provision_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_teardown_failure(&self) {
        self.teardown_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped_idle(&self) {
        self.reaped_idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self) {
        self.routed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        vec![
            ("created".into(), self.created.load(Ordering::Relaxed)),
            (
                "provision_failures".into(),
                self.provision_failures.load(Ordering::Relaxed),
            ),
            (
                "provision_timeouts".into(),
                self.provision_timeouts.load(Ordering::Relaxed),
            ),
            ("superseded".into(), self.superseded.load(Ordering::Relaxed)),
            ("destroyed".into(), self.destroyed.load(Ordering::Relaxed)),
            (
                "teardown_failures".into(),
                self.teardown_failures.load(Ordering::Relaxed),
            ),
            ("reaped_idle".into(), self.reaped_idle.load(Ordering::Relaxed)),
            (
                "routed_requests".into(),
                self.routed_requests.load(Ordering::Relaxed),
            ),
            (
                "backend_errors".into(),
                self.backend_errors.load(Ordering::Relaxed),
            ),
            (
                "denied_requests".into(),
                self.denied_requests.load(Ordering::Relaxed),
            ),
            (
                "active_workspaces".into(),
                self.active_workspaces.load(Ordering::Relaxed),
            ),
            (
                "peak_workspaces".into(),
                self.peak_workspaces.load(Ordering::Relaxed),
            ),
        ]
    }
}

static METRICS: WorkspaceMetrics = WorkspaceMetrics::new();

pub fn metrics() -> &'static WorkspaceMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_tracks_peak_and_never_underflows() {
        let m = WorkspaceMetrics::new();
        m.record_ready();
        m.record_ready();
        m.record_released();
        m.record_released();
        m.record_released();
        assert_eq!(m.active_workspaces.load(Ordering::Relaxed), 0);
        assert_eq!(m.peak_workspaces.load(Ordering::Relaxed), 2);
        assert_eq!(m.created.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn snapshot_lists_every_counter() {
        let m = WorkspaceMetrics::new();
        m.record_routed();
        m.record_backend_error();
        let snap = m.snapshot();
        assert_eq!(snap.len(), 12);
        assert!(snap.contains(&("routed_requests".to_string(), 1)));
        assert!(snap.contains(&("backend_errors".to_string(), 1)));
    }
}
