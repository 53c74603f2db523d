//! Workspace readiness probing.

use std::time::Duration;
use tracing::debug;

/// Decides whether a workspace at `address` is serving.
#[async_trait::async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, address: &str) -> bool;
}

/// GET `http://{address}/`. Any HTTP response counts as ready; only
/// connection-level failures do not.
pub struct HttpProbe {
    request_timeout: Duration,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, address: &str) -> bool {
        let url = format!("http://{address}/");
        let client = match crate::util::http_client() {
            Ok(client) => client,
            Err(err) => {
                debug!("probe: {err}");
                return false;
            }
        };
        match client.get(&url).timeout(self.request_timeout).send().await {
            Ok(resp) => {
                debug!("probe: {url} answered {}", resp.status());
                true
            }
            Err(err) => {
                debug!("probe: {url} not ready: {err}");
                false
            }
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Succeeds after `ready_after` failed probes, or never when `never_ready()`.
    pub struct MockProbe {
        pub probe_count: AtomicUsize,
        pub ready_after: AtomicUsize,
        pub never: AtomicBool,
    }

    impl MockProbe {
        pub fn ready() -> Self {
            Self {
                probe_count: AtomicUsize::new(0),
                ready_after: AtomicUsize::new(0),
                never: AtomicBool::new(false),
            }
        }

        pub fn never_ready() -> Self {
            let mock = Self::ready();
            mock.never.store(true, Ordering::SeqCst);
            mock
        }
    }

    #[async_trait::async_trait]
    impl ReadinessProbe for MockProbe {
        async fn probe(&self, _address: &str) -> bool {
            let seen = self.probe_count.fetch_add(1, Ordering::SeqCst);
            !self.never.load(Ordering::SeqCst) && seen >= self.ready_after.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn any_http_status_is_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let address = server.address().to_string();
        assert!(HttpProbe::default().probe(&address).await);
    }

    #[tokio::test]
    async fn closed_port_is_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(!HttpProbe::new(Duration::from_secs(1)).probe(&address).await);
    }
}
