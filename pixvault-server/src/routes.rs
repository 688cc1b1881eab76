use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers::{blobs, ops, photos},
    infra::app_state::AppState,
};

pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/photos/search", get(photos::enqueue_search))
        .route("/photos/latest", post(photos::enqueue_latest))
        .route("/photos/recent", get(photos::list_recent))
        .route("/photos/local/search", get(photos::search_local))
        .route("/photos/id/{id}", get(photos::get_by_id))
        .route("/photos/{external_id}", get(photos::resolve_photo))
        .route("/blobs/{*key}", get(blobs::get_blob))
        .route("/ping", get(ops::ping))
        .route("/health", get(ops::health))
        .route("/queue/stats", get(ops::queue_stats))
        .route("/queue/dead-letters", get(ops::dead_letters))
        .route("/ingest/stats", get(ops::ingest_stats))
}

pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state);

    create_api_router()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// Permissive in dev, allow-list otherwise; an empty list allows any origin.
fn cors_layer(state: &AppState) -> CorsLayer {
    if state.config().dev_mode {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = state
        .config()
        .cors
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}
