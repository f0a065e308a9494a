//! Reachability checks against remote measurement servers

use super::{ApiError, ApiResult, AppState, respond};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health/check-server", post(check_server))
        .route("/health/check-servers", post(check_servers))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CheckServerRequest {
    host: String,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CheckServersRequest {
    servers: Vec<String>,
    port: Option<u16>,
}

async fn check_server(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CheckServerRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let host = request.host.trim();
    if host.is_empty() {
        return Err(ApiError::InvalidParameters("host is required".to_string()));
    }
    let port = request
        .port
        .unwrap_or(state.orchestrator.binary_config().default_port);

    respond(state.prober.check_server(host, port).await)
}

async fn check_servers(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CheckServersRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let hosts: Vec<String> = request
        .servers
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if hosts.is_empty() {
        return Err(ApiError::InvalidParameters(
            "servers must be a non-empty list".to_string(),
        ));
    }
    let port = request
        .port
        .unwrap_or(state.orchestrator.binary_config().default_port);

    respond(state.prober.check_multiple(&hosts, port).await)
}

#[cfg(test)]
mod tests {
    use crate::handlers::test_support::{app, call};
    use axum::http::StatusCode;
    use serde_json::json;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_requires_host() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;

        let (status, body) =
            call(&app, "POST", "/api/health/check-server", Some(json!({ "host": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_PARAMETERS");

        let (status, _) =
            call(&app, "POST", "/api/health/check-servers", Some(json!({ "servers": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unresolvable_host_reported_in_body() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/health/check-server",
            Some(json!({ "host": "no-such-host.invalid", "port": 25000 })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["reachable"], false);
        assert!(body["recommendation"].is_string());
    }
}
