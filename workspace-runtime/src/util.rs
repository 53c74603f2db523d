use once_cell::sync::OnceCell;
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Client;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, WorkspaceError};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared outbound HTTP client (readiness probes, OAuth exchange).
pub fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|err| WorkspaceError::Http(format!("Failed to build HTTP client: {err}")))
    })
}

pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Opaque session credential handed to the browser.
pub fn generate_token() -> String {
    random_hex(15)
}

/// Workspace id; doubles as the container name and the path-routing prefix.
pub fn generate_slug() -> String {
    random_hex(5)
}

/// Identity session ids and OAuth `state` values.
pub fn generate_nonce() -> String {
    random_hex(16)
}

/// User ids end up in host paths, so only a conservative alphabet is accepted.
pub fn is_path_safe(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Extract a cookie value from a `Cookie` header.
pub fn cookie_value<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

pub fn build_cookie(name: &str, value: &str, secure: bool) -> String {
    let secure_flag = if secure { " Secure;" } else { "" };
    format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax;{secure_flag}")
}

pub fn expired_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}
