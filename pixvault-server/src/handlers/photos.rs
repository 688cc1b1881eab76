use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use pixvault_core::domain::{
    PageRequest, Photo, PhotoId, PhotoStore, SearchTask,
    task::DEFAULT_LIST_PER_PAGE,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

/// Raw query-string values; numbers are parsed leniently so a bad `page`
/// falls back to its default instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub query: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl ListParams {
    fn required_query(&self) -> AppResult<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| AppError::bad_request("query parameter is required"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuedResponse {
    pub message: String,
    pub query: String,
    pub page: i32,
    pub per_page: i32,
}

/// GET /photos/{external_id} - resolve through the engine, ingesting on a
/// miss. Waits for an admission slot without a bound.
pub async fn resolve_photo(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> AppResult<Json<Photo>> {
    let _slot = state.gate.acquire(&state.shutdown, None).await?;
    let photo = state.engine.resolve_by_external_id(&external_id).await?;
    Ok(Json(photo))
}

/// GET /photos/search - queue an upstream search and answer 202.
pub async fn enqueue_search(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AppResult<impl IntoResponse> {
    let query = params.required_query()?;
    let task = SearchTask::from_params(
        query,
        params.page.as_deref(),
        params.per_page.as_deref(),
    );
    enqueue(&state, task, "Search task queued").await
}

/// POST /photos/latest - queue ingestion of the newest upstream photos.
pub async fn enqueue_latest(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AppResult<impl IntoResponse> {
    let task = SearchTask::from_params(
        "",
        params.page.as_deref(),
        params.per_page.as_deref(),
    );
    enqueue(&state, task, "Latest photos task queued").await
}

async fn enqueue(
    state: &AppState,
    task: SearchTask,
    message: &str,
) -> AppResult<(StatusCode, Json<QueuedResponse>)> {
    let _slot = state
        .gate
        .acquire(
            &state.shutdown,
            Some(state.config().admission.search_wait()),
        )
        .await?;

    state.queue.publish(&task).await?;
    info!(
        query = %task.query,
        page = task.page,
        per_page = task.per_page,
        "task queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            message: message.to_string(),
            query: task.query,
            page: task.page,
            per_page: task.per_page,
        }),
    ))
}

/// GET /photos/recent - newest stored photos.
pub async fn list_recent(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Vec<Photo>>> {
    let page = PageRequest::from_params(
        params.page.as_deref(),
        params.per_page.as_deref(),
        DEFAULT_LIST_PER_PAGE,
    );
    Ok(Json(state.store.list_recent(page).await?))
}

/// GET /photos/local/search - search stored metadata only.
pub async fn search_local(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Vec<Photo>>> {
    let query = params.required_query()?;
    let page = PageRequest::from_params(
        params.page.as_deref(),
        params.per_page.as_deref(),
        DEFAULT_LIST_PER_PAGE,
    );
    debug!(query, page = page.page, "local search");
    Ok(Json(state.store.search(query, page).await?))
}

/// GET /photos/id/{id} - stored photo by internal id.
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<Photo>> {
    let id = Uuid::parse_str(&raw_id)
        .map(PhotoId)
        .map_err(|_| AppError::bad_request("invalid photo id"))?;

    state
        .store
        .get_by_internal_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Photo {id} not found")))
}
