//! Host network diagnostics

use super::{ApiError, ApiResult, AppState, respond};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/diagnostics/system", get(system))
        .route("/diagnostics/connections", get(connections))
        .route("/diagnostics/firewall", get(firewall))
        .route("/diagnostics/quick-test", post(quick_test))
        .route("/diagnostics/complete", post(complete))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PortQuery {
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TargetRequest {
    server: String,
    port: Option<u16>,
}

impl TargetRequest {
    fn target(&self, state: &AppState) -> Result<(String, u16), ApiError> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(ApiError::InvalidParameters("server is required".to_string()));
        }
        let port = self
            .port
            .unwrap_or(state.orchestrator.binary_config().default_port);
        Ok((server.to_string(), port))
    }
}

async fn system(State(state): State<Arc<AppState>>) -> ApiResult {
    let (system_config, firewall) = tokio::join!(
        state.diagnostics.system_config(),
        state.diagnostics.firewall_status()
    );
    respond(json!({ "systemConfig": system_config, "firewall": firewall }))
}

async fn connections(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PortQuery>, QueryRejection>,
) -> ApiResult {
    let Query(query) = query?;
    let port = query
        .port
        .unwrap_or(state.orchestrator.binary_config().default_port);
    respond(state.diagnostics.connection_tracking(port).await)
}

async fn firewall(State(state): State<Arc<AppState>>) -> ApiResult {
    respond(state.diagnostics.firewall_status().await)
}

async fn quick_test(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TargetRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let (server, port) = request.target(&state)?;
    let result = state.diagnostics.quick_test(&server, port).await;
    respond(json!({ "test": result }))
}

async fn complete(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TargetRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let (server, port) = request.target(&state)?;
    let report = state.diagnostics.complete(&server, port).await;
    respond(json!({ "diagnostics": report }))
}
