//! Internal HTTP surface for the trainer tier.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;

use quiver_core::Error;

use crate::service::{ExperimentStats, TrainerService};

#[derive(Clone)]
pub struct TrainerState {
    pub service: Arc<TrainerService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_reply(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        Error::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
        _ => {
            error!(error = %err, "trainer request failed");
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

#[derive(Debug, Default, Deserialize)]
pub struct FlushRequest {
    #[serde(default)]
    pub experiment_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub events_processed: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub experiment_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

pub fn router(state: TrainerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/internal/v1/flush", post(flush_handler))
        .route("/internal/v1/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<TrainerState>) -> impl IntoResponse {
    let status = if state.service.health().await {
        "SERVING"
    } else {
        "NOT_SERVING"
    };
    Json(HealthResponse {
        status: status.to_string(),
    })
}

async fn flush_handler(
    State(state): State<TrainerState>,
    Json(request): Json<FlushRequest>,
) -> Result<Json<FlushResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .flush_batch(request.experiment_id)
        .await
        .map(|events_processed| Json(FlushResponse { events_processed }))
        .map_err(error_reply)
}

async fn stats_handler(
    State(state): State<TrainerState>,
    Query(query): Query<StatsQuery>,
) -> Json<Vec<ExperimentStats>> {
    Json(state.service.get_stats(query.experiment_id.as_deref()))
}
