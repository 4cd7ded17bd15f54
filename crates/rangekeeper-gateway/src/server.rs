//! HTTP control plane — axum routes over the execution gateway
//!
//! Every sandbox operation is exposed under `/sandbox`. Errors carry a
//! stable machine-readable code and map onto the orchestrator's HTTP
//! status taxonomy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use rangekeeper_core::config::OrchestratorConfig;
use rangekeeper_core::engine::ResourceUsage;
use rangekeeper_core::error::SandboxError;
use rangekeeper_core::gateway::{CommandRequest, ExecutionGateway, ExecutionResult};
use rangekeeper_core::lifecycle::ContainerInstance;
use rangekeeper_core::network::{NetworkManager, SegmentInfo};
use rangekeeper_core::pool::{PoolStatus, ReadinessReport};
use rangekeeper_core::security::{SecurityEvent, SecurityReport};
use rangekeeper_core::validator::ValidationVerdict;

use crate::protocol::{
    AckResponse, AuditQuery, ErrorBody, PrepareRequest, SessionCreateRequest, SnapshotRequest,
    SnapshotResponse,
};

/// Shared state behind every handler.
pub struct AppState {
    pub gateway: Arc<ExecutionGateway>,
    pub network: Arc<NetworkManager>,
    /// Source of truth for `POST /sandbox/config/reload`.
    pub config_path: Option<PathBuf>,
}

struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sandbox/execute", post(execute))
        .route("/sandbox/validate", post(validate))
        .route("/sandbox/prepare", post(prepare))
        .route("/sandbox/session/{id}/create", post(session_create))
        .route("/sandbox/session/{id}", delete(session_destroy))
        .route("/sandbox/status", get(status))
        .route("/sandbox/list", get(list))
        .route("/sandbox/metrics/{id}", get(metrics))
        .route("/sandbox/snapshot/{id}", post(snapshot))
        // Snapshot images contain slashes, hence the wildcard
        .route("/sandbox/restore/{*snapshot}", post(restore))
        .route("/sandbox/security/audit-log", get(audit_log))
        .route("/sandbox/security/report", get(security_report))
        .route("/sandbox/security/unblock/{user}", post(unblock))
        .route("/sandbox/network/list", get(network_list))
        .route("/sandbox/network/info/{name}", get(network_info))
        .route("/sandbox/config/reload", post(config_reload))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    Ok(Json(state.gateway.execute(&request).await?))
}

async fn validate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<ValidationVerdict>, ApiError> {
    Ok(Json(state.gateway.validate_only(&request).await?))
}

async fn prepare(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PrepareRequest>,
) -> Result<Json<ReadinessReport>, ApiError> {
    let profile = match request.profile {
        Some(profile) => profile,
        None => state.gateway.config().await.default_profile.clone(),
    };
    let report = state
        .gateway
        .pool()
        .prepare(&profile, request.force_restart)
        .await?;
    Ok(Json(report))
}

async fn session_create(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<SessionCreateRequest>>,
) -> Result<Json<ContainerInstance>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let instance = state
        .gateway
        .pool()
        .create_session(&id, request.template.as_deref())
        .await?;
    Ok(Json(instance))
}

async fn session_destroy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state.gateway.pool().destroy_session(&id).await?;
    Ok(Json(AckResponse::ok()))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<PoolStatus> {
    Json(state.gateway.pool().status().await)
}

async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<ContainerInstance>> {
    Json(state.gateway.pool().list().await)
}

async fn metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ResourceUsage>, ApiError> {
    Ok(Json(state.gateway.pool().metrics(&id).await?))
}

async fn snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<SnapshotRequest>>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let image = state.gateway.pool().snapshot(&id, &request.label).await?;
    Ok(Json(SnapshotResponse { image }))
}

async fn restore(
    State(state): State<Arc<AppState>>,
    Path(snapshot): Path<String>,
) -> Result<Json<ContainerInstance>, ApiError> {
    Ok(Json(state.gateway.pool().restore(&snapshot).await?))
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<SecurityEvent>> {
    Json(state.gateway.monitor().audit_log(query.limit).await)
}

async fn security_report(State(state): State<Arc<AppState>>) -> Json<SecurityReport> {
    Json(state.gateway.monitor().report().await)
}

async fn unblock(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    if state.gateway.monitor().unblock(&user) {
        info!("User '{}' unblocked via API", user);
        Ok(Json(AckResponse::ok()))
    } else {
        Err(SandboxError::NotFound(format!("no active block for user '{}'", user)).into())
    }
}

async fn network_list(State(state): State<Arc<AppState>>) -> Json<Vec<SegmentInfo>> {
    Json(state.network.list().await)
}

async fn network_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<SegmentInfo>, ApiError> {
    state
        .network
        .info(&name)
        .await
        .map(Json)
        .ok_or_else(|| SandboxError::NotFound(format!("network segment '{}'", name)).into())
}

/// Re-read the config file and push the new rule tables, security
/// settings, pool policy, and network segments into the running system.
async fn config_reload(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AckResponse>, ApiError> {
    let path = state
        .config_path
        .as_ref()
        .ok_or_else(|| SandboxError::Config("no config file to reload from".to_string()))?;
    let config = OrchestratorConfig::load(path)
        .map_err(|e| SandboxError::Config(format!("reload failed: {:#}", e)))?;
    state
        .network
        .ensure_all(&config.networks)
        .await
        .map_err(|e| {
            warn!("Network convergence during reload failed: {}", e);
            e
        })?;
    state.gateway.reload_config(config).await;
    Ok(Json(AckResponse::with_detail(format!(
        "reloaded from {}",
        path.display()
    ))))
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Sandbox API listening on {}", addr);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
