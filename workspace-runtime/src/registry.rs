//! In-memory workspace registry and routing table.
//!
//! Every operation takes the single registry lock, so supersession, readiness
//! publication and teardown claims are atomic with respect to each other. The
//! routing table (`session token -> address`) lives under the same lock and
//! only ever holds entries for `Ready` workspaces.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, WorkspaceError};
use crate::runtime::RuntimeHandle;
use crate::util::{generate_slug, generate_token, now_ts};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Provisioning,
    Ready,
    Destroying,
    Gone,
}

impl WorkspaceState {
    pub fn is_active(self) -> bool {
        matches!(self, WorkspaceState::Provisioning | WorkspaceState::Ready)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Workspace {
    pub id: String,
    pub owner: String,
    pub state: WorkspaceState,
    /// `host:port`, set once the workspace is Ready.
    pub address: Option<String>,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub profile: String,
}

/// Result of [`Registry::issue`].
#[derive(Debug)]
pub struct Issued {
    pub token: String,
    pub workspace_id: String,
    /// The user's previous workspace, already moved to `Destroying`.
    pub superseded: Option<Workspace>,
}

/// Who owns the runtime teardown after [`Registry::mark_destroying`].
#[derive(Debug)]
pub enum Teardown {
    /// The caller must stop and remove the container, then purge.
    Claimed {
        workspace: Workspace,
        handle: Option<RuntimeHandle>,
    },
    /// The provisioning task is still running and will tear down on its own.
    Deferred,
    /// Unknown id, or another caller already claimed the teardown.
    Absent,
}

struct Entry {
    workspace: Workspace,
    token: String,
    handle: Option<RuntimeHandle>,
    teardown_claimed: bool,
    provisioning_active: bool,
}

#[derive(Default)]
struct Inner {
    workspaces: HashMap<String, Entry>,
    /// user id -> the user's current (Provisioning/Ready) workspace id
    by_user: HashMap<String, String>,
    by_token: HashMap<String, String>,
    routes: HashMap<String, String>,
    /// Set by [`Registry::close`]; `issue` refuses from then on.
    closed: bool,
}

impl Inner {
    /// Leave `Ready`/`Provisioning`: drop the route and the user's active pointer.
    fn retire(&mut self, workspace_id: &str) {
        let Some(entry) = self.workspaces.get_mut(workspace_id) else {
            return;
        };
        entry.workspace.state = WorkspaceState::Destroying;
        self.routes.remove(&entry.token);
        if self.by_user.get(&entry.workspace.owner).map(String::as_str) == Some(workspace_id) {
            self.by_user.remove(&entry.workspace.owner);
        }
    }
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a pending workspace for `user_id`, superseding any active one.
    /// Fails with [`WorkspaceError::Draining`] once the registry is closed.
    pub fn issue(&self, user_id: &str, profile: &str) -> Result<Issued> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(WorkspaceError::Draining(format!(
                "no new workspace for user {user_id} during shutdown"
            )));
        }

        let superseded = match inner.by_user.get(user_id).cloned() {
            Some(old_id) => {
                inner.retire(&old_id);
                inner.workspaces.get(&old_id).map(|e| e.workspace.clone())
            }
            None => None,
        };

        let mut workspace_id = generate_slug();
        while inner.workspaces.contains_key(&workspace_id) {
            workspace_id = generate_slug();
        }
        let mut token = generate_token();
        while inner.by_token.contains_key(&token) {
            token = generate_token();
        }

        let now = now_ts();
        let workspace = Workspace {
            id: workspace_id.clone(),
            owner: user_id.to_string(),
            state: WorkspaceState::Provisioning,
            address: None,
            created_at: now,
            last_activity_at: now,
            profile: profile.to_string(),
        };
        inner.workspaces.insert(
            workspace_id.clone(),
            Entry {
                workspace,
                token: token.clone(),
                handle: None,
                teardown_claimed: false,
                provisioning_active: true,
            },
        );
        inner.by_user.insert(user_id.to_string(), workspace_id.clone());
        inner.by_token.insert(token.clone(), workspace_id.clone());

        if let Some(old) = &superseded {
            info!(
                "registry: workspace {} for user {user_id} superseded by {workspace_id}",
                old.id
            );
        }

        Ok(Issued {
            token,
            workspace_id,
            superseded,
        })
    }

    /// Refuse every later `issue`. Ids returned by `workspace_ids` after this
    /// call are the complete set of workspaces that will ever exist.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Provisioning -> Ready. Publishes the routing entry.
    pub fn bind_ready(&self, workspace_id: &str, address: &str) -> Result<Workspace> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let Some(entry) = inner.workspaces.get_mut(workspace_id) else {
            return Err(WorkspaceError::Superseded(format!(
                "workspace {workspace_id} no longer exists"
            )));
        };
        let current =
            inner.by_user.get(&entry.workspace.owner).map(String::as_str) == Some(workspace_id);
        if entry.workspace.state != WorkspaceState::Provisioning || !current {
            debug!(
                "registry: refusing to publish workspace {workspace_id} in state {:?}",
                entry.workspace.state
            );
            return Err(WorkspaceError::Superseded(format!(
                "workspace {workspace_id} was superseded before becoming ready"
            )));
        }

        let now = now_ts();
        entry.workspace.state = WorkspaceState::Ready;
        entry.workspace.address = Some(address.to_string());
        entry.workspace.created_at = now;
        entry.workspace.last_activity_at = now;
        entry.provisioning_active = false;
        inner.routes.insert(entry.token.clone(), address.to_string());
        Ok(entry.workspace.clone())
    }

    /// Look up the Ready workspace bound to `token`.
    pub fn resolve(&self, token: &str) -> Option<Workspace> {
        let inner = self.lock();
        inner.routes.get(token)?;
        let id = inner.by_token.get(token)?;
        inner
            .workspaces
            .get(id)
            .filter(|e| e.workspace.state == WorkspaceState::Ready)
            .map(|e| e.workspace.clone())
    }

    /// Record activity for the workspace bound to `token` and return its
    /// current route. `None` once the workspace is no longer Ready.
    pub fn touch(&self, token: &str) -> Option<String> {
        let mut inner = self.lock();
        let address = inner.routes.get(token)?.clone();
        let id = inner.by_token.get(token)?.clone();
        match inner.workspaces.get_mut(&id) {
            Some(entry) if entry.workspace.state == WorkspaceState::Ready => {
                entry.workspace.last_activity_at = entry.workspace.last_activity_at.max(now_ts());
                Some(address)
            }
            _ => None,
        }
    }

    /// Stop routing to the workspace and decide who tears it down. Idempotent.
    pub fn mark_destroying(&self, workspace_id: &str) -> Teardown {
        let mut inner = self.lock();
        match inner.workspaces.get(workspace_id) {
            None => return Teardown::Absent,
            Some(entry) if entry.teardown_claimed => return Teardown::Absent,
            Some(_) => {}
        }
        inner.retire(workspace_id);

        let Some(entry) = inner.workspaces.get_mut(workspace_id) else {
            return Teardown::Absent;
        };
        if entry.provisioning_active {
            return Teardown::Deferred;
        }
        entry.teardown_claimed = true;
        Teardown::Claimed {
            workspace: entry.workspace.clone(),
            handle: entry.handle.clone(),
        }
    }

    /// Drop every record of the workspace. Idempotent.
    pub fn purge(&self, workspace_id: &str) {
        let mut inner = self.lock();
        let Some(entry) = inner.workspaces.remove(workspace_id) else {
            return;
        };
        inner.routes.remove(&entry.token);
        inner.by_token.remove(&entry.token);
        if inner.by_user.get(&entry.workspace.owner).map(String::as_str) == Some(workspace_id) {
            inner.by_user.remove(&entry.workspace.owner);
        }
    }

    pub fn attach_handle(&self, workspace_id: &str, handle: RuntimeHandle) {
        if let Some(entry) = self.lock().workspaces.get_mut(workspace_id) {
            entry.handle = Some(handle);
        }
    }

    /// The provisioning task will no longer touch the runtime for this workspace.
    pub fn end_provisioning(&self, workspace_id: &str) {
        if let Some(entry) = self.lock().workspaces.get_mut(workspace_id) {
            entry.provisioning_active = false;
        }
    }

    /// True while the workspace is still its owner's active workspace.
    pub fn is_current(&self, workspace_id: &str) -> bool {
        let inner = self.lock();
        inner
            .workspaces
            .get(workspace_id)
            .is_some_and(|e| {
                e.workspace.state.is_active()
                    && inner.by_user.get(&e.workspace.owner).map(String::as_str)
                        == Some(workspace_id)
            })
    }

    /// Ready workspaces idle for strictly longer than `timeout_secs` at `now`.
    pub fn idle_ready(&self, now: u64, timeout_secs: u64) -> Vec<String> {
        self.lock()
            .workspaces
            .values()
            .filter(|e| e.workspace.state == WorkspaceState::Ready)
            .filter(|e| now.saturating_sub(e.workspace.last_activity_at) > timeout_secs)
            .map(|e| e.workspace.id.clone())
            .collect()
    }

    pub fn workspace_ids(&self) -> Vec<String> {
        self.lock().workspaces.keys().cloned().collect()
    }

    pub fn get(&self, workspace_id: &str) -> Option<Workspace> {
        self.lock()
            .workspaces
            .get(workspace_id)
            .map(|e| e.workspace.clone())
    }

    pub fn snapshot(&self) -> Vec<Workspace> {
        let mut list: Vec<Workspace> = self
            .lock()
            .workspaces
            .values()
            .map(|e| e.workspace.clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn active_for_user(&self, user_id: &str) -> Option<Workspace> {
        let inner = self.lock();
        let id = inner.by_user.get(user_id)?;
        inner.workspaces.get(id).map(|e| e.workspace.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
