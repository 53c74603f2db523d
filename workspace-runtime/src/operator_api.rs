//! Axum-based operator API.
//!
//! Provides REST endpoints for:
//! - Listing workspaces, or looking one up by id or owner (bearer admin token)
//! - Reading process metrics (bearer admin token)
//! - Liveness

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

use crate::metrics::metrics;
use crate::registry::{Registry, Workspace};

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OperatorState {
    registry: Arc<Registry>,
    admin_token: Arc<str>,
}

impl OperatorState {
    pub fn new(registry: Arc<Registry>, admin_token: &str) -> Self {
        Self {
            registry,
            admin_token: Arc::from(admin_token),
        }
    }
}

pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

fn require_admin(state: &OperatorState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ApiError>)> {
    if state.admin_token.is_empty() {
        return Err(api_error(StatusCode::FORBIDDEN, "Operator API is disabled"));
    }
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;
    let token = extract_bearer_token(auth_header)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Invalid Authorization header format"))?;
    if bool::from(token.as_bytes().ct_eq(state.admin_token.as_bytes())) {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn list_workspaces(State(state): State<OperatorState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = require_admin(&state, &headers) {
        return err.into_response();
    }
    let workspaces: Vec<Workspace> = state.registry.snapshot();
    (
        StatusCode::OK,
        Json(serde_json::json!({ "workspaces": workspaces })),
    )
        .into_response()
}

async fn get_workspace(
    State(state): State<OperatorState>,
    headers: HeaderMap,
    Path(workspace_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = require_admin(&state, &headers) {
        return err.into_response();
    }
    match state.registry.get(&workspace_id) {
        Some(workspace) => (StatusCode::OK, Json(workspace)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Workspace not found").into_response(),
    }
}

async fn get_user_workspace(
    State(state): State<OperatorState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = require_admin(&state, &headers) {
        return err.into_response();
    }
    match state.registry.active_for_user(&user_id) {
        Some(workspace) => (StatusCode::OK, Json(workspace)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "User has no active workspace").into_response(),
    }
}

async fn get_metrics(State(state): State<OperatorState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = require_admin(&state, &headers) {
        return err.into_response();
    }
    let counters: serde_json::Map<String, serde_json::Value> = metrics()
        .snapshot()
        .into_iter()
        .map(|(name, value)| (name, value.into()))
        .collect();
    (StatusCode::OK, Json(serde_json::Value::Object(counters))).into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn operator_api_router(state: OperatorState) -> Router {
    Router::new()
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/workspaces/{workspace_id}", get(get_workspace))
        .route("/api/users/{user_id}/workspace", get(get_user_workspace))
        .route("/api/metrics", get(get_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn app(registry: Arc<Registry>) -> Router {
        operator_api_router(OperatorState::new(registry, "admin-secret"))
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", "Bearer admin-secret")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_workspaces() {
        let registry = Arc::new(Registry::new());
        let issued = registry.issue("u1", "default").unwrap();
        registry.bind_ready(&issued.workspace_id, "10.0.0.5:8443").unwrap();

        let response = app(registry).oneshot(authed("/api/workspaces")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        let list = json["workspaces"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["owner"], "u1");
        assert_eq!(list[0]["state"], "ready");
        assert_eq!(list[0]["address"], "10.0.0.5:8443");
        assert!(list[0].get("token").is_none());
    }

    #[tokio::test]
    async fn test_get_workspace_by_id_and_owner() {
        let registry = Arc::new(Registry::new());
        let issued = registry.issue("u1", "default").unwrap();
        let app = app(registry.clone());

        let response = app
            .clone()
            .oneshot(authed(&format!("/api/workspaces/{}", issued.workspace_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["state"], "provisioning");

        let response = app.clone().oneshot(authed("/api/users/u1/workspace")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["id"], issued.workspace_id.as_str());

        registry.mark_destroying(&issued.workspace_id);
        let response = app.clone().oneshot(authed("/api/users/u1/workspace")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(authed("/api/workspaces/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "Workspace not found");
    }

    #[tokio::test]
    async fn test_list_workspaces_requires_auth() {
        let response = app(Arc::new(Registry::new()))
            .oneshot(
                Request::builder()
                    .uri("/api/workspaces")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let response = app(Arc::new(Registry::new()))
            .oneshot(
                Request::builder()
                    .uri("/api/metrics")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "Invalid admin token");
    }

    #[tokio::test]
    async fn test_disabled_without_admin_token() {
        let app = operator_api_router(OperatorState::new(Arc::new(Registry::new()), ""));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/workspaces")
                    .header("authorization", "Bearer ")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let response = app(Arc::new(Registry::new()))
            .oneshot(authed("/api/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert!(json.get("routed_requests").is_some());

        let response = app(Arc::new(Registry::new()))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }
}
