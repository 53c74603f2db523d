//! Identity gate: who is the caller, and may they have a workspace.

use dashmap::DashMap;
use reqwest::Url;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::GithubSettings;
use crate::error::{Result, WorkspaceError};
use crate::util::{generate_nonce, http_client, now_ts};

#[async_trait::async_trait]
pub trait IdentityGate: Send + Sync {
    /// Where to send the browser to start authentication.
    fn authorize_url(&self, state: &str) -> Result<String>;

    /// Trade the callback `code` for a stable user id.
    async fn exchange(&self, code: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// GitHub OAuth
// ---------------------------------------------------------------------------

pub struct GithubGate {
    settings: GithubSettings,
}

impl GithubGate {
    pub fn new(settings: GithubSettings) -> Self {
        Self { settings }
    }

    async fn access_token(&self, code: &str) -> Result<String> {
        let resp = http_client()?
            .post(&self.settings.token_url)
            .header("accept", "application/json")
            .form(&[
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.settings.callback_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WorkspaceError::Auth(format!("GitHub token request: {e}")))?;

        if !resp.status().is_success() {
            let err_body = resp.text().await.unwrap_or_default();
            return Err(WorkspaceError::Auth(format!(
                "GitHub token request failed: {err_body}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| WorkspaceError::Auth(format!("GitHub token parse: {e}")))?;

        if let Some(error) = body["error"].as_str() {
            let description = body["error_description"].as_str().unwrap_or(error);
            return Err(WorkspaceError::Auth(format!(
                "GitHub rejected the code: {description}"
            )));
        }
        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WorkspaceError::Auth("No access_token in GitHub token response".into()))
    }
}

#[async_trait::async_trait]
impl IdentityGate for GithubGate {
    fn authorize_url(&self, state: &str) -> Result<String> {
        let url = Url::parse_with_params(
            &self.settings.authorize_url,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.callback_url.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| WorkspaceError::Config(format!("Invalid GitHub authorize_url: {e}")))?;
        Ok(url.to_string())
    }

    async fn exchange(&self, code: &str) -> Result<String> {
        let token = self.access_token(code).await?;
        let url = format!("{}/user", self.settings.api_url.trim_end_matches('/'));
        let resp = http_client()?
            .get(&url)
            .bearer_auth(&token)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "workspace-gate")
            .send()
            .await
            .map_err(|e| WorkspaceError::Auth(format!("GitHub user request: {e}")))?;

        if !resp.status().is_success() {
            return Err(WorkspaceError::Auth(format!(
                "GitHub user request failed with {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| WorkspaceError::Auth(format!("GitHub user parse: {e}")))?;

        let user_id = match &body["id"] {
            Value::Number(id) => id.to_string(),
            Value::String(id) if !id.is_empty() => id.clone(),
            _ => return Err(WorkspaceError::Auth("No id in GitHub user response".into())),
        };
        debug!(
            "identity: GitHub login {} is user {user_id}",
            body["login"].as_str().unwrap_or("?")
        );
        Ok(user_id)
    }
}

// ---------------------------------------------------------------------------
// Identity sessions
// ---------------------------------------------------------------------------

struct IdentitySession {
    user_id: String,
    expires_at: u64,
}

/// Opaque identity-cookie value -> authenticated user id.
///
/// Sessions expire `ttl_secs` after sign-in. Expired entries stop resolving
/// immediately and are dropped by [`IdentitySessions::gc`].
pub struct IdentitySessions {
    sessions: DashMap<String, IdentitySession>,
    ttl_secs: u64,
}

impl IdentitySessions {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl_secs,
        }
    }

    pub fn create(&self, user_id: &str) -> String {
        let sid = generate_nonce();
        self.sessions.insert(
            sid.clone(),
            IdentitySession {
                user_id: user_id.to_string(),
                expires_at: now_ts().saturating_add(self.ttl_secs),
            },
        );
        sid
    }

    pub fn user_for(&self, sid: &str) -> Option<String> {
        let now = now_ts();
        self.sessions
            .get(sid)
            .filter(|session| session.expires_at > now)
            .map(|session| session.user_id.clone())
    }

    pub fn remove(&self, sid: &str) {
        self.sessions.remove(sid);
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn gc(&self) -> usize {
        let now = now_ts();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Compare the callback `state` with the value stored in the browser.
pub fn state_matches(expected: &str, received: &str) -> bool {
    !expected.is_empty() && expected.as_bytes().ct_eq(received.as_bytes()).into()
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;

    /// Maps fixed callback codes to user ids.
    pub struct MockGate {
        users: HashMap<String, String>,
    }

    impl MockGate {
        pub fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                users: pairs
                    .iter()
                    .map(|(code, user)| (code.to_string(), user.to_string()))
                    .collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl IdentityGate for MockGate {
        fn authorize_url(&self, state: &str) -> Result<String> {
            Ok(format!("https://idp.test/authorize?state={state}"))
        }

        async fn exchange(&self, code: &str) -> Result<String> {
            self.users
                .get(code)
                .cloned()
                .ok_or_else(|| WorkspaceError::Auth(format!("unknown code {code}")))
        }
    }
}
