use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::fleet::{ControllerError, FleetStats, GroupError, MetricKind, ScalingRequest};
use crate::network::{FlowCheck, FlowDecision, GroupType};
use crate::server::state::AppState;

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        // Groups
        .route("/v1/groups", get(list_groups))
        .route("/v1/groups/{name}", get(get_group))
        .route("/v1/groups/{name}/scale", post(scale_group))
        .route("/v1/groups/{name}/traffic", post(simulate_traffic))
        .route("/v1/groups/{name}/metrics", post(record_metrics))
        .route("/v1/groups/{name}/evaluate", post(evaluate_group))
        .route("/v1/groups/{name}/health-check", post(check_group_health))
        // Security groups
        .route("/v1/security-groups", get(list_security_groups))
        .route("/v1/security-groups/validate", post(validate_security_group))
        .route("/v1/security-groups/{id}/authorize", post(authorize_traffic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_status(err: &ControllerError) -> StatusCode {
    match err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        ControllerError::GroupExists(_)
        | ControllerError::SecurityGroupExists(_)
        | ControllerError::Group(GroupError::NotRunning(_))
        | ControllerError::Group(GroupError::AlreadyStarted(_)) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(err: ControllerError) -> Response {
    let status = error_status(&err);
    warn!(status = status.as_u16(), "Request failed: {}", err);
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn reply<T: Serialize>(result: Result<T, ControllerError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Health & Status
// ============================================================================

pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FleetStatusResponse {
    pub status: String,
    pub stats: FleetStats,
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(FleetStatusResponse {
        status: "ok".to_string(),
        stats: state.controller.stats(),
    })
}

// ============================================================================
// Groups
// ============================================================================

pub async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.list_group_statuses())
}

pub async fn get_group(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    reply(state.controller.group_status(&name))
}

pub async fn scale_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ScalingRequest>,
) -> Response {
    let result = state.controller.handle_scaling_request(&name, &req);
    if matches!(&result, Ok(r) if r.success) {
        state.persist();
    }
    reply(result)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrafficRequest {
    /// CPU percentage applied to every active instance
    pub load: f64,
}

pub async fn simulate_traffic(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<TrafficRequest>,
) -> Response {
    reply(state.controller.simulate_traffic(&name, req.load))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsRequest {
    pub metric: MetricKind,
    /// Instance id to value
    pub samples: HashMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub matched: usize,
}

pub async fn record_metrics(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<MetricsRequest>,
) -> Response {
    reply(
        state
            .controller
            .record_metric(&name, req.metric, &req.samples)
            .map(|matched| MetricsResponse { matched }),
    )
}

pub async fn evaluate_group(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let result = state.controller.evaluate(&name);
    if matches!(&result, Ok(activity) if !activity.is_empty()) {
        state.persist();
    }
    reply(result)
}

pub async fn check_group_health(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let result = state.controller.check_health(&name);
    if matches!(&result, Ok(replacements) if !replacements.is_empty()) {
        state.persist();
    }
    reply(result)
}

// ============================================================================
// Security Groups
// ============================================================================

pub async fn list_security_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.list_security_groups())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub group_type: GroupType,
}

pub async fn validate_security_group(
    State(state): State<AppState>,
    Json(req): Json<ValidationRequest>,
) -> Response {
    reply(state.controller.validate_security_group(req.group_type))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeRequest {
    pub flows: Vec<FlowCheck>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    pub group_id: String,
    pub decisions: Vec<FlowDecision>,
}

pub async fn authorize_traffic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AuthorizeRequest>,
) -> Response {
    reply(
        state
            .controller
            .authorize(&id, &req.flows)
            .map(|decisions| AuthorizeResponse {
                group_id: id,
                decisions,
            }),
    )
}
