//! Client test runs

use super::{ApiError, ApiResult, AppState, respond};
use crate::config::BinaryConfig;
use crate::output::export_csv;
use crate::storage::TestStatus;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use protocol::{ClientParams, IpVersion, TestType};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_LIST_LIMIT: u32 = 50;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/client/start", post(start_test))
        .route("/test/status/{id}", get(test_status))
        .route("/test/results/{id}", get(test_results))
        .route("/test/stop/{id}", post(stop_test))
        .route("/test/list", get(list_tests))
        .route("/test/export", get(export_tests))
        .route("/test/{id}", delete(delete_test))
        .route("/test", delete(clear_tests))
}

/// Raw client start body. `testType` stays a string so a bad value is
/// reported as INVALID_PARAMETERS rather than a deserialisation error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StartTestRequest {
    test_type: Option<String>,
    servers: Vec<String>,
    port: Option<u16>,
    duration: Option<u32>,
    connections: Option<u32>,
    ip_version: Option<IpVersion>,
    jumbo_frames: Option<bool>,
    bandwidth: Option<u32>,
    verbose: bool,
}

impl StartTestRequest {
    fn into_params(self, binary: &BinaryConfig) -> Result<ClientParams, ApiError> {
        let test_type = self
            .test_type
            .as_deref()
            .and_then(|t| t.parse::<TestType>().ok())
            .ok_or_else(|| {
                ApiError::InvalidParameters(
                    "testType must be \"upstream\" or \"downstream\"".to_string(),
                )
            })?;

        let servers: Vec<String> = self
            .servers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if servers.is_empty() {
            return Err(ApiError::InvalidParameters(
                "At least one server must be specified".to_string(),
            ));
        }

        let defaults = ClientParams::default();
        let duration = self.duration.unwrap_or(binary.default_duration_sec);
        if duration == 0 {
            return Err(ApiError::InvalidParameters(
                "duration must be at least 1 second".to_string(),
            ));
        }
        let connections = self.connections.unwrap_or(defaults.connections);
        if connections == 0 {
            return Err(ApiError::InvalidParameters(
                "connections must be at least 1".to_string(),
            ));
        }

        Ok(ClientParams {
            test_type,
            servers,
            port: self.port.unwrap_or(binary.default_port),
            connections,
            duration,
            bandwidth: self.bandwidth.unwrap_or(0),
            ip_version: self.ip_version.unwrap_or_default(),
            jumbo_frames: self.jumbo_frames.unwrap_or(true),
            verbose: self.verbose,
            json_output: true,
        })
    }
}

async fn start_test(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StartTestRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let params = request.into_params(state.orchestrator.binary_config())?;

    let started = state.orchestrator.start_client_test(params).await?;
    respond(json!({
        "testId": started.test_id,
        "status": started.status,
        "commandLine": started.command_line,
        "message": "Test started successfully",
    }))
}

async fn test_status(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    respond(state.orchestrator.test_status(&id).await?)
}

async fn test_results(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    respond(state.orchestrator.test_results(&id).await?)
}

async fn stop_test(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.orchestrator.stop_test(&id).await?;
    respond(json!({ "message": "Test stopped successfully" }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListQuery {
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

fn parse_status(status: Option<&str>) -> Result<Option<TestStatus>, ApiError> {
    match status {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(ApiError::InvalidParameters),
    }
}

async fn list_tests(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let status = parse_status(query.status.as_deref())?;
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let (tests, total) = state.orchestrator.list_tests(status, limit, offset).await?;
    respond(json!({
        "tests": tests,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
}

async fn export_tests(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let status = parse_status(query.status.as_deref())?;

    let rows = state.orchestrator.db().export_tests(status).await?;
    let csv = export_csv(&rows)?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"udpst-tests.csv\"",
            ),
        ],
        csv,
    ))
}

async fn delete_test(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    state.orchestrator.delete_test(&id).await?;
    respond(json!({ "message": "Test deleted successfully" }))
}

async fn clear_tests(State(state): State<Arc<AppState>>) -> ApiResult {
    let deleted = state.orchestrator.clear_tests().await?;
    respond(json!({ "deleted": deleted, "message": "All tests cleared" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{app, call};
    use crate::orchestrator::test_support::fake_binary;
    use axum::http::StatusCode;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(body: serde_json::Value) -> StartTestRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_validation_messages() {
        let binary = BinaryConfig::default();

        let err = request(json!({ "testType": "sideways", "servers": ["10.0.0.1"] }))
            .into_params(&binary)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
        assert!(err.to_string().contains("upstream"));

        let err = request(json!({ "testType": "upstream", "servers": ["  "] }))
            .into_params(&binary)
            .unwrap_err();
        assert_eq!(err.to_string(), "At least one server must be specified");

        let err = request(json!({ "servers": ["10.0.0.1"] }))
            .into_params(&binary)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
    }

    #[test]
    fn test_defaults_fill_in() {
        let binary = BinaryConfig::default();
        let params = request(json!({
            "testType": "downstream",
            "servers": [" 10.0.0.1 ", "10.0.0.2"],
            "ipVersion": "ipv6",
            "jumboFrames": false
        }))
        .into_params(&binary)
        .unwrap();

        assert_eq!(params.servers, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(params.port, binary.default_port);
        assert_eq!(params.duration, binary.default_duration_sec);
        assert_eq!(params.ip_version, IpVersion::Ipv6);
        assert!(!params.jumbo_frames);
        assert!(params.json_output);
    }

    #[test]
    fn test_status_filter() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(parse_status(Some("")).unwrap(), None);
        assert_eq!(
            parse_status(Some("completed_with_warnings")).unwrap(),
            Some(TestStatus::CompletedWithWarnings)
        );
        assert!(parse_status(Some("bogus")).is_err());
    }

    #[tokio::test]
    async fn test_invalid_start_never_reaches_binary() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/client/start",
            Some(json!({ "testType": "upstream", "servers": [] })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_PARAMETERS");

        let (_, body) = call(&app, "GET", "/api/test/list", None).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let app = app(PathBuf::from("/nonexistent/udpst")).await;

        let (status, body) = call(&app, "GET", "/api/test/status/test_0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");

        let (status, _) = call(&app, "GET", "/api/test/results/test_0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "POST", "/api/test/stop/test_0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "NOT_RUNNING");

        let (status, _) = call(&app, "DELETE", "/api/test/test_0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_through_api() {
        let dir = TempDir::new().unwrap();
        let binary = fake_binary(
            &dir,
            r#"echo '{"ErrorStatus": 0, "IPLayerCapacity": 850.5}'"#,
        );
        let app = app(binary).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/client/start",
            Some(json!({ "testType": "downstream", "servers": ["127.0.0.1"], "duration": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let test_id = body["testId"].as_str().unwrap().to_string();

        let mut final_status = String::new();
        for _ in 0..50 {
            let (_, body) = call(&app, "GET", &format!("/api/test/status/{test_id}"), None).await;
            final_status = body["status"].as_str().unwrap_or_default().to_string();
            if final_status == "completed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(final_status, "completed");

        let (_, body) = call(&app, "GET", &format!("/api/test/results/{test_id}"), None).await;
        assert_eq!(body["results"]["throughput"], 850.5);

        let (_, body) = call(&app, "GET", "/api/test/list?status=completed&limit=5", None).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["limit"], 5);

        let (status, _) = call(&app, "GET", "/api/test/list?status=bogus", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "DELETE", "/api/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 1);
    }
}
