//! HTTP API consumed by the control panel UI
//!
//! Every success body is a JSON object carrying `success: true` next to the
//! payload fields. Failures are `{success: false, error, code}` where `code`
//! is one of a small stable set the UI switches on.

mod diagnostics;
mod health;
mod runs;
mod server;

use crate::diagnostics::Diagnostics;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::probe::Prober;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub prober: Prober,
    pub diagnostics: Diagnostics,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidParameters(_) => "INVALID_PARAMETERS",
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::AlreadyRunning(_) => "ALREADY_RUNNING",
                OrchestratorError::NotRunning(_) => "NOT_RUNNING",
                OrchestratorError::NotFound(_) => "NOT_FOUND",
                OrchestratorError::Storage(_) => "INTERNAL_ERROR",
                OrchestratorError::BinaryNotFound { .. }
                | OrchestratorError::ProcessSpawn(_)
                | OrchestratorError::StartupFailed(_)
                | OrchestratorError::TimeoutExceeded(_) => "EXECUTION_FAILED",
            },
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "INTERNAL_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidParameters(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidParameters(rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Serialize `body` and tag it with `success: true` unless it already
/// carries its own `success` field.
pub fn respond<T: Serialize>(body: T) -> ApiResult {
    let value = serde_json::to_value(body).map_err(|e| ApiError::Internal(e.to_string()))?;
    let value = match value {
        Value::Object(mut map) => {
            map.entry("success").or_insert(Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "data": other }),
    };
    Ok(Json(value))
}

async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .merge(server::routes())
        .merge(runs::routes())
        .merge(health::routes())
        .merge(diagnostics::routes());

    Router::new()
        .route("/health", get(liveness))
        .nest("/api", api)
        .with_state(state)
        .layer(cors)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{BinaryConfig, ProbeConfig};
    use crate::orchestrator::test_support::orchestrator;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::path::PathBuf;
    use tower::ServiceExt;

    pub async fn app(binary: PathBuf) -> Router {
        let orchestrator = orchestrator(binary).await;
        let binary_config = BinaryConfig {
            path: orchestrator.binary_config().path.clone(),
            ..Default::default()
        };
        let state = AppState {
            prober: Prober::new(ProbeConfig::default(), binary_config.clone()),
            diagnostics: Diagnostics::new(binary_config),
            orchestrator,
        };
        router(Arc::new(state))
    }

    /// Send one request and decode the JSON reply.
    pub async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

#[cfg(test)]
mod api_tests {
    use super::test_support::{app, call};
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_codes_and_statuses() {
        let cases: Vec<(ApiError, &str, StatusCode)> = vec![
            (
                ApiError::InvalidParameters("bad".into()),
                "INVALID_PARAMETERS",
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::AlreadyRunning("server_1".into()).into(),
                "ALREADY_RUNNING",
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::NotRunning("Server".into()).into(),
                "NOT_RUNNING",
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::NotFound("test_1".into()).into(),
                "NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::ProcessSpawn("denied".into()).into(),
                "EXECUTION_FAILED",
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::Storage("locked".into()).into(),
                "INTERNAL_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn test_respond_tags_success() {
        let Json(value) = respond(json!({ "testId": "test_1" })).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["testId"], "test_1");

        let Json(value) = respond(json!({ "success": false })).unwrap();
        assert_eq!(value["success"], false);

        let Json(value) = respond(vec![1, 2]).unwrap();
        assert_eq!(value["data"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_liveness() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
