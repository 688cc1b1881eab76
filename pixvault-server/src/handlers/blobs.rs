use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use pixvault_core::domain::{BlobKey, BlobStore};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

// Keys are derived from upstream ids, so an object never changes under a key
// except by re-ingesting the same photo.
const BLOB_CACHE_CONTROL: &str = "public, max-age=86400";

/// GET /blobs/{*key} - stream a stored binary with its content type.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Response> {
    let key = key.trim_matches('/');
    if key.is_empty() || key.split('/').any(|segment| segment == "..") {
        return Err(AppError::bad_request("invalid blob key"));
    }

    let blob = state.blobs.get(&BlobKey::new(key)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, blob.content_type),
            (header::CACHE_CONTROL, BLOB_CACHE_CONTROL.to_string()),
        ],
        blob.bytes,
    )
        .into_response())
}
