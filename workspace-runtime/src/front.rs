//! Public HTTP front: login flow plus the session-gated catch-all proxy.

use axum::{
    Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::RoutingStrategy;
use crate::identity::{IdentityGate, IdentitySessions, state_matches};
use crate::lifecycle::Lifecycle;
use crate::metrics::metrics;
use crate::proxy::{self, HttpClient};
use crate::registry::Workspace;
use crate::shutdown::ShutdownCoordinator;
use crate::util::{build_cookie, cookie_value, expired_cookie, generate_nonce};
use crate::views;
use crate::{IDENTITY_COOKIE, OAUTH_STATE_COOKIE, SESSION_COOKIE};

#[derive(Clone)]
pub struct FrontState {
    lifecycle: Lifecycle,
    gate: Arc<dyn IdentityGate>,
    sessions: Arc<IdentitySessions>,
    shutdown: Arc<ShutdownCoordinator>,
    client: HttpClient,
}

impl FrontState {
    pub fn new(
        lifecycle: Lifecycle,
        gate: Arc<dyn IdentityGate>,
        sessions: Arc<IdentitySessions>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            lifecycle,
            gate,
            sessions,
            shutdown,
            client: proxy::build_client(),
        }
    }

    fn secure_cookies(&self) -> bool {
        self.lifecycle.config().cookie_secure
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|h| cookie_value(h, name))
        .filter(|v| !v.is_empty())
}

fn with_cookies(mut response: Response, cookies: &[String]) -> Response {
    for c in cookies {
        match HeaderValue::from_str(c) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(err) => error!("front: invalid Set-Cookie value: {err}"),
        }
    }
    response
}

fn deny_redirect() -> Response {
    metrics().record_denied();
    Redirect::to("/deny").into_response()
}

/// Where the browser lands after login.
fn workspace_home(strategy: RoutingStrategy, workspace: &Workspace) -> String {
    match strategy {
        RoutingStrategy::Host => "/".to_string(),
        RoutingStrategy::Path => format!("/{}/", workspace.id),
    }
}

enum Route {
    Forward(String),
    Redirect(String),
}

/// Map an inbound path onto the workspace according to the routing strategy.
fn route_for(strategy: RoutingStrategy, workspace_id: &str, path: &str, query: Option<&str>) -> Route {
    let suffix = query.map(|q| format!("?{q}")).unwrap_or_default();
    match strategy {
        RoutingStrategy::Host => Route::Forward(format!("{path}{suffix}")),
        RoutingStrategy::Path => {
            let prefix = format!("/{workspace_id}");
            match path.strip_prefix(&prefix) {
                Some("") => Route::Redirect(format!("{prefix}/{suffix}")),
                Some(rest) if rest.starts_with('/') => Route::Forward(format!("{rest}{suffix}")),
                _ => Route::Redirect(format!("{prefix}{path}{suffix}")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Login flow
// ---------------------------------------------------------------------------

async fn login(State(state): State<FrontState>) -> Response {
    let nonce = generate_nonce();
    match state.gate.authorize_url(&nonce) {
        Ok(url) => with_cookies(
            Redirect::to(&url).into_response(),
            &[build_cookie(OAUTH_STATE_COOKIE, &nonce, state.secure_cookies())],
        ),
        Err(err) => {
            error!("front: cannot start login: {err}");
            views::login(StatusCode::INTERNAL_SERVER_ERROR, Some("Sign-in is not configured."))
        }
    }
}

#[derive(Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn auth_callback(
    State(state): State<FrontState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        warn!("front: identity provider returned error {error}");
        return views::login(StatusCode::UNAUTHORIZED, Some("Sign-in was cancelled."));
    }
    let expected = cookie(&headers, OAUTH_STATE_COOKIE).unwrap_or_default();
    let received = params.state.unwrap_or_default();
    let Some(code) = params.code.filter(|_| state_matches(expected, &received)) else {
        return views::login(StatusCode::BAD_REQUEST, Some("Sign-in expired, please try again."));
    };

    let user_id = match state.gate.exchange(&code).await {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!("front: identity exchange failed: {err}");
            return views::login(StatusCode::UNAUTHORIZED, Some("Sign-in failed."));
        }
    };

    let secure = state.secure_cookies();
    let config = state.lifecycle.config().clone();
    if let Some(previous) = cookie(&headers, IDENTITY_COOKIE) {
        state.sessions.remove(previous);
    }
    let sid = state.sessions.create(&user_id);
    let identity_cookie = build_cookie(IDENTITY_COOKIE, &sid, secure);

    if config.is_denied(&user_id) {
        info!("front: user {user_id} is deny-listed");
        return with_cookies(
            deny_redirect(),
            &[identity_cookie, expired_cookie(OAUTH_STATE_COOKIE)],
        );
    }
    if state.shutdown.is_draining() {
        return views::login(StatusCode::SERVICE_UNAVAILABLE, Some("The service is shutting down."));
    }

    let lifecycle = state.lifecycle.clone();
    let sessions = state.sessions.clone();
    tokio::spawn(async move { crate::reaper::reaper_tick(&lifecycle, &sessions).await });

    let profile = config.profile_name_for(&user_id);
    match state.lifecycle.create(&user_id, profile).await {
        Ok(session) => {
            let home = workspace_home(config.routing, &session.workspace);
            with_cookies(
                Redirect::to(&home).into_response(),
                &[
                    build_cookie(SESSION_COOKIE, &session.token, secure),
                    identity_cookie,
                    expired_cookie(OAUTH_STATE_COOKIE),
                ],
            )
        }
        Err(err) => {
            error!("front: workspace for user {user_id} failed: {err}");
            let notice = match err.kind() {
                "superseded" => "A newer sign-in replaced this workspace.",
                "draining" => "The service is shutting down.",
                "provision_timeout" => "Your workspace did not start in time.",
                _ => "Your workspace could not be started.",
            };
            with_cookies(
                views::login(StatusCode::SERVICE_UNAVAILABLE, Some(notice)),
                &[identity_cookie, expired_cookie(OAUTH_STATE_COOKIE)],
            )
        }
    }
}

async fn deny() -> Response {
    views::deny()
}

async fn logout(State(state): State<FrontState>, headers: HeaderMap) -> Response {
    if let Some(sid) = cookie(&headers, IDENTITY_COOKIE) {
        state.sessions.remove(sid);
    }
    with_cookies(
        views::signed_out(),
        &[expired_cookie(IDENTITY_COOKIE), expired_cookie(SESSION_COOKIE)],
    )
}

// ---------------------------------------------------------------------------
// Catch-all
// ---------------------------------------------------------------------------

async fn route_request(State(state): State<FrontState>, req: Request) -> Response {
    let registry = state.lifecycle.registry();
    let config = state.lifecycle.config();

    let identity = cookie(req.headers(), IDENTITY_COOKIE).and_then(|sid| state.sessions.user_for(sid));
    let token = cookie(req.headers(), SESSION_COOKIE).map(str::to_string);
    let workspace = token.as_deref().and_then(|t| registry.resolve(t));

    let denied = identity.iter().any(|user| config.is_denied(user))
        || workspace.as_ref().is_some_and(|ws| config.is_denied(&ws.owner));
    if denied {
        return deny_redirect();
    }

    let (Some(token), Some(workspace)) = (token, workspace) else {
        return views::login(StatusCode::OK, None);
    };

    let path_and_query = match route_for(
        config.routing,
        &workspace.id,
        req.uri().path(),
        req.uri().query(),
    ) {
        Route::Forward(path) => path,
        Route::Redirect(location) => return Redirect::temporary(&location).into_response(),
    };

    // Teardown may have started since `resolve`.
    let Some(address) = registry.touch(&token) else {
        return views::login(StatusCode::OK, None);
    };
    metrics().record_routed();
    match proxy::forward(&state.client, req, &address, &path_and_query).await {
        Ok(response) => response,
        Err(err) => {
            metrics().record_backend_error();
            warn!(
                "front: workspace {} of user {} unreachable: {err}",
                workspace.id, workspace.owner
            );
            (StatusCode::BAD_GATEWAY, Body::from("Bad Gateway")).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn front_router(state: FrontState) -> Router {
    Router::new()
        .route("/login", get(login))
        .route("/auth/callback", get(auth_callback))
        .route("/deny", get(deny))
        .route("/logout", get(logout))
        .fallback(route_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::identity::mock::MockGate;
    use crate::probe::mock::MockProbe;
    use crate::registry::Registry;
    use crate::runtime::mock::MockRuntime;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::util::ServiceExt;

    struct Harness {
        app: Router,
        runtime: Arc<MockRuntime>,
        lifecycle: Lifecycle,
        sessions: Arc<IdentitySessions>,
        _storage: tempfile::TempDir,
    }

    fn harness(deny: &[&str]) -> Harness {
        let storage = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        for profile in config.profiles.values_mut() {
            profile.storage_root = storage.path().to_path_buf();
        }
        config.deny_list = deny.iter().map(|u| u.to_string()).collect();
        let runtime = Arc::new(MockRuntime::new("127.0.0.1:9"));
        let lifecycle = Lifecycle::new(
            Arc::new(Registry::new()),
            runtime.clone(),
            Arc::new(MockProbe::ready()),
            Arc::new(config),
        );
        let shutdown = Arc::new(ShutdownCoordinator::new(
            lifecycle.clone(),
            Duration::from_secs(1),
        ));
        let sessions = Arc::new(IdentitySessions::new(3600));
        let state = FrontState::new(
            lifecycle.clone(),
            Arc::new(MockGate::new(&[("good", "u1"), ("evil", "666")])),
            sessions.clone(),
            shutdown,
        );
        Harness {
            app: front_router(state),
            runtime,
            lifecycle,
            sessions,
            _storage: storage,
        }
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn login_redirects_with_state_cookie() {
        let h = harness(&[]);
        let response = h.app.oneshot(get("/login", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://idp.test/authorize?state="));
        assert!(set_cookies(&response)[0].starts_with("oauth_state="));
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_rejected() {
        let h = harness(&[]);
        let response = h
            .app
            .oneshot(get(
                "/auth/callback?code=good&state=abc",
                Some("oauth_state=xyz"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.runtime.start_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_creates_workspace_and_sets_cookies() {
        let h = harness(&[]);
        let response = h
            .app
            .oneshot(get(
                "/auth/callback?code=good&state=abc",
                Some("oauth_state=abc"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");

        let cookies = set_cookies(&response);
        let session = cookies
            .iter()
            .find(|c| c.starts_with("workspace_session="))
            .unwrap();
        let token = session
            .trim_start_matches("workspace_session=")
            .split(';')
            .next()
            .unwrap();
        let ws = h.lifecycle.registry().resolve(token).unwrap();
        assert_eq!(ws.owner, "u1");
    }

    #[tokio::test]
    async fn denied_user_never_reaches_create() {
        let h = harness(&["666"]);
        let response = h
            .app
            .clone()
            .oneshot(get(
                "/auth/callback?code=evil&state=abc",
                Some("oauth_state=abc"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/deny");
        assert_eq!(h.runtime.start_count.load(Ordering::SeqCst), 0);
        assert!(h.lifecycle.registry().is_empty());

        let identity = set_cookies(&response)
            .into_iter()
            .find(|c| c.starts_with("gate_session="))
            .unwrap();
        let identity = identity.split(';').next().unwrap().to_string();
        let response = h.app.oneshot(get("/anything", Some(&identity))).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/deny");
    }

    #[tokio::test]
    async fn relogin_from_same_browser_replaces_identity_session() {
        let h = harness(&[]);
        let mut identity: Option<String> = None;
        for _ in 0..20 {
            let cookies = match &identity {
                Some(sid) => format!("oauth_state=abc; {sid}"),
                None => "oauth_state=abc".to_string(),
            };
            let response = h
                .app
                .clone()
                .oneshot(get("/auth/callback?code=good&state=abc", Some(&cookies)))
                .await
                .unwrap();
            identity = set_cookies(&response)
                .into_iter()
                .find(|c| c.starts_with("gate_session="))
                .map(|c| c.split(';').next().unwrap().to_string());
        }
        assert_eq!(h.sessions.len(), 1);
        let ready = h
            .lifecycle
            .registry()
            .snapshot()
            .into_iter()
            .filter(|w| w.state == crate::registry::WorkspaceState::Ready)
            .count();
        assert_eq!(ready, 1);
    }

    #[tokio::test]
    async fn destroying_workspace_is_not_forwarded() {
        let h = harness(&[]);
        let session = h.lifecycle.create("u1", "default").await.unwrap();
        let teardown = h.lifecycle.registry().mark_destroying(&session.workspace.id);
        assert!(matches!(teardown, crate::registry::Teardown::Claimed { .. }));

        let cookie = format!("workspace_session={}", session.token);
        let response = h.app.oneshot(get("/", Some(&cookie))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("/login"));
    }

    #[tokio::test]
    async fn callback_during_drain_is_refused() {
        let h = harness(&[]);
        h.lifecycle.registry().close();
        let response = h
            .app
            .oneshot(get(
                "/auth/callback?code=good&state=abc",
                Some("oauth_state=abc"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(h.lifecycle.registry().is_empty());
        assert_eq!(h.runtime.start_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn anonymous_request_gets_login_view() {
        let h = harness(&[]);
        let response = h
            .app
            .oneshot(get("/some/page", Some("workspace_session=unknown")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway_without_registry_change() {
        let h = harness(&[]);
        let session = h.lifecycle.create("u1", "default").await.unwrap();
        let cookie = format!("workspace_session={}", session.token);
        let response = h.app.oneshot(get("/", Some(&cookie))).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(h.lifecycle.registry().resolve(&session.token).is_some());
    }

    #[test]
    fn path_strategy_routing() {
        let forward = |path, query| match route_for(RoutingStrategy::Path, "ab12", path, query) {
            Route::Forward(p) => format!("F {p}"),
            Route::Redirect(p) => format!("R {p}"),
        };
        assert_eq!(forward("/ab12/static/app.js", Some("v=1")), "F /static/app.js?v=1");
        assert_eq!(forward("/ab12/", None), "F /");
        assert_eq!(forward("/ab12", None), "R /ab12/");
        assert_eq!(forward("/ab123/x", None), "R /ab12/ab123/x");
        assert_eq!(forward("/favicon.ico", None), "R /ab12/favicon.ico");
    }

    #[test]
    fn host_strategy_forwards_unchanged() {
        match route_for(RoutingStrategy::Host, "ab12", "/a/b", Some("q=1")) {
            Route::Forward(p) => assert_eq!(p, "/a/b?q=1"),
            Route::Redirect(_) => panic!("host routing never redirects"),
        }
    }
}
