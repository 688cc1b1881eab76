use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use pixvault_core::{
    admission::GateSnapshot,
    ingest::IngestStatsSnapshot,
    queue::{DeadLetter, QueueBroker, QueueSnapshot},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::infra::{app_state::AppState, errors::AppResult};

const DEFAULT_DEAD_LETTER_LIMIT: u32 = 20;
const MAX_DEAD_LETTER_LIMIT: u32 = 100;

pub async fn ping() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

/// GET /health - database round trip when a pool is configured.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = state.database.as_ref() else {
        return (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "database": "not_configured" })),
        );
    };

    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "database": "ok" })),
        ),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "database": "unreachable" })),
            )
        }
    }
}

/// GET /queue/stats
pub async fn queue_stats(
    State(state): State<AppState>,
) -> AppResult<Json<QueueSnapshot>> {
    Ok(Json(state.queue.broker().snapshot().await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterParams {
    pub limit: Option<u32>,
}

/// GET /queue/dead-letters - newest dead-lettered tasks first.
pub async fn dead_letters(
    State(state): State<AppState>,
    Query(params): Query<DeadLetterParams>,
) -> AppResult<Json<Vec<DeadLetter>>> {
    let limit = params
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    Ok(Json(state.queue.broker().dead_letters(limit).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestStatsResponse {
    pub ingest: IngestStatsSnapshot,
    pub admission: GateSnapshot,
}

/// GET /ingest/stats - engine counters and gate occupancy.
pub async fn ingest_stats(
    State(state): State<AppState>,
) -> Json<IngestStatsResponse> {
    Json(IngestStatsResponse {
        ingest: state.engine.stats().snapshot(),
        admission: state.gate.snapshot(),
    })
}
