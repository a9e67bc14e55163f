//! Public HTTP surface of the proxy tier.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use quiver_core::gate::GateConfig;
use quiver_core::{Context, Error, Experiment, Pool};
use quiver_store::{ArmSpec, ExperimentUpdate};

use crate::service::{ProxyService, SelectOutcome};

#[derive(Clone)]
pub struct ProxyState {
    pub service: Arc<ProxyService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type Reply<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn error_reply(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
        Error::DeadlineExceeded(_) => (StatusCode::REQUEST_TIMEOUT, "DEADLINE_EXCEEDED"),
        Error::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
        Error::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
        Error::PermissionDenied(_) => (StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
        Error::ResourceExhausted(_) => (StatusCode::TOO_MANY_REQUESTS, "RESOURCE_EXHAUSTED"),
        Error::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
        _ => {
            error!(error = %err, "proxy request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct ArmInput {
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub arms: Vec<ArmInput>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    pub pool_id: String,
    pub policy: String,
    #[serde(default)]
    pub policy_params: Map<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateExperimentRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub policy_params: Option<Map<String, Value>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub context: Context,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub request_id: String,
    pub reward: f64,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/pools", post(create_pool_handler).get(list_pools_handler))
        .route(
            "/api/v1/pools/:id",
            get(get_pool_handler).delete(delete_pool_handler),
        )
        .route(
            "/api/v1/experiments",
            post(create_experiment_handler).get(list_experiments_handler),
        )
        .route(
            "/api/v1/experiments/:id",
            get(get_experiment_handler)
                .put(update_experiment_handler)
                .delete(delete_experiment_handler),
        )
        .route(
            "/api/v1/experiments/:id/gate",
            post(create_gate_handler)
                .get(get_gate_handler)
                .put(update_gate_handler)
                .delete(delete_gate_handler),
        )
        .route("/api/v1/experiments/:id/select", post(select_handler))
        .route("/api/v1/feedback", post(feedback_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<ProxyState>) -> impl IntoResponse {
    let status = if state.service.health().await {
        "SERVING"
    } else {
        "NOT_SERVING"
    };
    Json(HealthResponse {
        status: status.to_string(),
    })
}

// -- pools ------------------------------------------------------------------

async fn create_pool_handler(
    State(state): State<ProxyState>,
    Json(request): Json<CreatePoolRequest>,
) -> Reply<Pool> {
    let arms = request
        .arms
        .into_iter()
        .map(|arm| ArmSpec {
            name: arm.name,
            metadata: arm.metadata,
        })
        .collect();
    state
        .service
        .create_pool(&request.name, arms)
        .map(Json)
        .map_err(error_reply)
}

async fn get_pool_handler(State(state): State<ProxyState>, Path(id): Path<String>) -> Reply<Pool> {
    state.service.get_pool(&id).map(Json).map_err(error_reply)
}

async fn delete_pool_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .delete_pool(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_reply)
}

async fn list_pools_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ListQuery>,
) -> Reply<Vec<Pool>> {
    state
        .service
        .list_pools(query.limit, query.offset)
        .map(Json)
        .map_err(error_reply)
}

// -- experiments ------------------------------------------------------------

async fn create_experiment_handler(
    State(state): State<ProxyState>,
    Json(request): Json<CreateExperimentRequest>,
) -> Reply<Experiment> {
    state
        .service
        .create_experiment(
            &request.name,
            &request.pool_id,
            &request.policy,
            request.policy_params,
            request.enabled,
            request.gate,
        )
        .await
        .map(Json)
        .map_err(error_reply)
}

async fn get_experiment_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Reply<Experiment> {
    state
        .service
        .get_experiment(&id)
        .map(Json)
        .map_err(error_reply)
}

async fn update_experiment_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateExperimentRequest>,
) -> Reply<Experiment> {
    let update = ExperimentUpdate {
        name: request.name,
        policy: request.policy,
        policy_params: request.policy_params,
        enabled: request.enabled,
    };
    state
        .service
        .update_experiment(&id, update)
        .await
        .map(Json)
        .map_err(error_reply)
}

async fn delete_experiment_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .delete_experiment(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_reply)
}

async fn list_experiments_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ListQuery>,
) -> Reply<Vec<Experiment>> {
    state
        .service
        .list_experiments(query.limit, query.offset)
        .map(Json)
        .map_err(error_reply)
}

// -- gates ------------------------------------------------------------------

async fn create_gate_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Json(config): Json<GateConfig>,
) -> Reply<GateConfig> {
    state
        .service
        .create_gate(&id, config)
        .await
        .map(Json)
        .map_err(error_reply)
}

async fn get_gate_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Reply<GateConfig> {
    state.service.get_gate(&id).map(Json).map_err(error_reply)
}

async fn update_gate_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Json(config): Json<GateConfig>,
) -> Reply<GateConfig> {
    state
        .service
        .update_gate(&id, config)
        .await
        .map(Json)
        .map_err(error_reply)
}

async fn delete_gate_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .delete_gate(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(error_reply)
}

// -- select / feedback -------------------------------------------------------

async fn select_handler(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    Json(request): Json<SelectRequest>,
) -> Reply<SelectOutcome> {
    state
        .service
        .select(&id, request.context)
        .await
        .map(Json)
        .map_err(error_reply)
}

async fn feedback_handler(
    State(state): State<ProxyState>,
    Json(request): Json<FeedbackRequest>,
) -> Reply<FeedbackResponse> {
    state
        .service
        .feedback(&request.request_id, request.reward)
        .await
        .map(|accepted| Json(FeedbackResponse { accepted }))
        .map_err(error_reply)
}
