//! Reverse-proxy transport: forwards one request to a workspace backend.
//!
//! Bodies are streamed in both directions. Upgrade requests (websockets) get
//! the backend's `101` passed through, then the two upgraded connections are
//! spliced in a background task.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, error};

use crate::error::{Result, WorkspaceError};

pub type HttpClient = Client<HttpConnector, Body>;

pub fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn append_forwarded(headers: &mut HeaderMap) {
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }
}

/// Forward `req` to `http://{address}{path_and_query}` and return the backend response.
///
/// The inbound `Host` header is preserved so the workspace sees the public origin.
pub async fn forward(
    client: &HttpClient,
    mut req: Request<Body>,
    address: &str,
    path_and_query: &str,
) -> Result<Response<Body>> {
    let target = format!("http://{address}{path_and_query}");
    let uri: Uri = target
        .parse()
        .map_err(|e| WorkspaceError::Validation(format!("Invalid target URI {target}: {e}")))?;

    let upgrade = is_upgrade(req.headers());
    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

    let (parts, body) = req.into_parts();
    let mut forwarded = Request::builder()
        .method(parts.method)
        .uri(uri)
        .body(body)
        .map_err(|e| WorkspaceError::Http(format!("Failed to build proxy request: {e}")))?;
    let mut headers = parts.headers;
    let upgrade_headers = (
        headers.get(header::CONNECTION).cloned(),
        headers.get(header::UPGRADE).cloned(),
    );
    strip_hop_by_hop(&mut headers);
    append_forwarded(&mut headers);
    if upgrade {
        if let (Some(connection), Some(protocol)) = upgrade_headers {
            headers.insert(header::CONNECTION, connection);
            headers.insert(header::UPGRADE, protocol);
        }
    }
    *forwarded.headers_mut() = headers;

    debug!("proxy: forwarding to {target}");
    let mut response = client.request(forwarded).await.map_err(|err| {
        WorkspaceError::BackendUnreachable(format!("{target}: {err}"))
    })?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            let target = target.clone();
            tokio::spawn(async move {
                let (client_io, backend_io) = match tokio::join!(client_upgrade, backend_upgrade) {
                    (Ok(client_io), Ok(backend_io)) => (client_io, backend_io),
                    (Err(err), _) | (_, Err(err)) => {
                        error!("proxy: upgrade to {target} failed: {err}");
                        return;
                    }
                };
                let mut client_io = TokioIo::new(client_io);
                let mut backend_io = TokioIo::new(backend_io);
                match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
                    Ok((up, down)) => {
                        debug!("proxy: upgraded stream to {target} closed ({up}B up, {down}B down)")
                    }
                    Err(err) => debug!("proxy: upgraded stream to {target} ended: {err}"),
                }
            });
        }
        let (parts, _) = response.into_parts();
        return Ok(Response::from_parts(parts, Body::empty()));
    }

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}
