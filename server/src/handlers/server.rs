//! Server-role lifecycle and binary information

use super::{ApiError, ApiResult, AppState, respond};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::routing::{get, post};
use protocol::ServerParams;
use serde_json::{Value, json};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/server/start", post(start_server))
        .route("/server/stop", post(stop_server))
        .route("/server/status", get(server_status))
        .route("/server/connections", get(connections))
        .route("/binary/info", get(binary_info))
}

/// An absent or empty body starts the server with defaults. A missing `port`
/// takes the configured default.
async fn start_server(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult {
    let default_port = state.orchestrator.binary_config().default_port;
    let params = server_params(&body, default_port)?;

    let started = state.orchestrator.start_server(params).await?;
    respond(json!({
        "processId": started.process_id,
        "pid": started.pid,
        "config": started.config,
        "commandLine": started.command_line,
        "message": "Server started successfully",
    }))
}

fn server_params(body: &[u8], default_port: u16) -> Result<ServerParams, ApiError> {
    let mut value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice::<Value>(body)
            .map_err(|e| ApiError::InvalidParameters(format!("Malformed request body: {e}")))?
    };

    let Some(fields) = value.as_object_mut() else {
        return Err(ApiError::InvalidParameters(
            "Request body must be a JSON object".to_string(),
        ));
    };
    fields.entry("port").or_insert_with(|| json!(default_port));

    serde_json::from_value(value)
        .map_err(|e| ApiError::InvalidParameters(format!("Invalid server parameters: {e}")))
}

async fn stop_server(State(state): State<Arc<AppState>>) -> ApiResult {
    state.orchestrator.stop_server().await?;
    respond(json!({ "message": "Server stopped successfully" }))
}

async fn server_status(State(state): State<Arc<AppState>>) -> ApiResult {
    let status = state
        .orchestrator
        .server_status()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    respond(status)
}

async fn connections(State(state): State<Arc<AppState>>) -> ApiResult {
    let active = state.orchestrator.active_tests().await;
    respond(json!({ "total": active.len(), "connections": active }))
}

async fn binary_info(State(state): State<Arc<AppState>>) -> ApiResult {
    let info = state.orchestrator.check_binary().await;
    let mut body = serde_json::to_value(info).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["capabilities"] = json!({
        "authentication": true,
        "gso": true,
        "jumboFrames": true,
    });
    respond(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{app, call};
    use crate::orchestrator::test_support::fake_binary;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_binary_info_missing() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;
        let (status, body) = call(&app, "GET", "/api/binary/info", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["available"], false);
        assert_eq!(body["capabilities"]["jumboFrames"], true);
    }

    #[tokio::test]
    async fn test_start_without_binary_is_execution_failure() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;
        let (status, body) = call(&app, "POST", "/api/server/start", Some(json!({}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "EXECUTION_FAILED");
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let dir = TempDir::new().unwrap();
        let app = app(fake_binary(&dir, "exec sleep 30")).await;

        let (status, body) = call(&app, "GET", "/api/server/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["machineId"], "test-machine");

        let (status, body) =
            call(&app, "POST", "/api/server/start", Some(json!({ "port": 25010 }))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["config"]["port"], 25010);
        assert!(body["processId"].as_str().unwrap().starts_with("server_"));

        let (status, body) = call(&app, "POST", "/api/server/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "ALREADY_RUNNING");

        let (_, body) = call(&app, "GET", "/api/server/status", None).await;
        assert_eq!(body["running"], true);

        let (status, _) = call(&app, "POST", "/api/server/stop", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, "POST", "/api/server/stop", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "NOT_RUNNING");
    }

    #[test]
    fn test_server_params_from_body() {
        let params = server_params(b"", 26000).unwrap();
        assert_eq!(params.port, 26000);
        assert!(!params.daemon);

        let params = server_params(br#"{"daemon": true}"#, 26000).unwrap();
        assert_eq!(params.port, 26000);
        assert!(params.daemon);

        let params = server_params(br#"{"port": 25010}"#, 26000).unwrap();
        assert_eq!(params.port, 25010);

        let bad: [&[u8]; 4] = [
            b"{not json",
            b"[1, 2]",
            br#"{"port": "high"}"#,
            br#"{"port": 70000}"#,
        ];
        for bad in bad {
            let err = server_params(bad, 26000).unwrap_err();
            assert_eq!(err.code(), "INVALID_PARAMETERS");
        }
    }

    #[tokio::test]
    async fn test_start_with_malformed_body_is_invalid() {
        let dir = TempDir::new().unwrap();
        let app = app(fake_binary(&dir, "exec sleep 30")).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/server/start")
            .header("content-type", "application/json")
            .body(Body::from("{\"port\": 25010"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "INVALID_PARAMETERS");

        let (_, body) = call(&app, "GET", "/api/server/status", None).await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_start_without_port_uses_configured_default() {
        let dir = TempDir::new().unwrap();
        let app = app(fake_binary(&dir, "exec sleep 30")).await;

        let (status, body) =
            call(&app, "POST", "/api/server/start", Some(json!({ "verbose": true }))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["config"]["port"], 25000);
        assert_eq!(body["config"]["verbose"], true);

        let (status, _) = call(&app, "POST", "/api/server/stop", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_connections_empty() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;
        let (_, body) = call(&app, "GET", "/api/server/connections", None).await;
        assert_eq!(body["total"], 0);
        assert_eq!(body["connections"], json!([]));
    }
}
