//! Internal HTTP surface for the selector tier.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;

use quiver_core::{Context, Error};

use crate::service::{Selection, SelectorService};

#[derive(Clone)]
pub struct SelectorState {
    pub service: Arc<SelectorService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_reply(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
        _ => {
            error!(error = %err, "selector request failed");
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
pub struct SelectRequest {
    pub experiment_id: String,
    pub context: Context,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

pub fn router(state: SelectorState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/internal/v1/select", post(select_handler))
        .route(
            "/internal/v1/invalidate/:experiment_id",
            post(invalidate_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "SERVING".to_string(),
    })
}

async fn select_handler(
    State(state): State<SelectorState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<Selection>, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .select(&request.experiment_id, &request.context)
        .await
        .map(Json)
        .map_err(error_reply)
}

async fn invalidate_handler(
    State(state): State<SelectorState>,
    Path(experiment_id): Path<String>,
) -> StatusCode {
    state.service.invalidate(&experiment_id);
    StatusCode::NO_CONTENT
}
