use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use pixvault_core::{
    domain::{PageRequest, PhotoSource},
    error::SourceError,
    infra::{UnsplashClient, UnsplashSettings},
};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct Recorded {
    auth: Arc<Mutex<Vec<String>>>,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

fn photo_json(id: &str) -> Value {
    json!({
        "id": id,
        "description": format!("{id} description"),
        "alt_description": null,
        "width": 1200,
        "height": 800,
        "likes": 7,
        "views": 100,
        "downloads": 3,
        "urls": {
            "raw": format!("https://images.test/{id}/raw"),
            "full": format!("https://images.test/{id}/full"),
            "regular": "", "small": "", "thumb": ""
        },
        "user": {"id": "u1", "username": "author", "name": "Some Author"},
        "created_at": "2024-02-10T08:30:00Z"
    })
}

async fn photo_by_id(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Some(auth) = headers.get("authorization") {
        recorded
            .auth
            .lock()
            .unwrap()
            .push(auth.to_str().unwrap_or_default().to_string());
    }
    match id.as_str() {
        "missing" => (StatusCode::NOT_FOUND, Json(json!({"errors": ["Couldn't find Photo"]}))),
        "limited" => (StatusCode::FORBIDDEN, Json(json!({"errors": ["Rate Limit Exceeded"]}))),
        "broken" => (StatusCode::BAD_GATEWAY, Json(json!({"errors": ["upstream"]}))),
        _ => (StatusCode::OK, Json(photo_json(&id))),
    }
}

async fn search_photos(
    State(recorded): State<Recorded>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    recorded.queries.lock().unwrap().push(params);
    Json(json!({
        "total": 2,
        "total_pages": 1,
        "results": [photo_json("s1"), photo_json("s2")]
    }))
}

async fn list_photos(
    State(recorded): State<Recorded>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    recorded.queries.lock().unwrap().push(params);
    Json(json!([photo_json("n1")]))
}

async fn spawn_mock() -> Result<(String, Recorded)> {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/photos", get(list_photos))
        .route("/photos/{id}", get(photo_by_id))
        .route("/search/photos", get(search_photos))
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), recorded))
}

fn client(base_url: &str) -> Result<UnsplashClient> {
    Ok(UnsplashClient::new(
        UnsplashSettings::new("test-key").with_base_url(base_url),
    )?)
}

#[tokio::test]
async fn fetch_by_id_maps_wire_model() -> Result<()> {
    let (base, recorded) = spawn_mock().await?;
    let client = client(&base)?;

    let photo = client.fetch_by_id("abc").await?;

    assert_eq!(photo.external_id, "abc");
    assert_eq!(photo.title, "abc description");
    assert_eq!(photo.author_name, "Some Author");
    assert_eq!(photo.source_url, "https://images.test/abc/full");
    assert_eq!((photo.width, photo.height), (1200, 800));
    assert_eq!(
        (photo.likes_count, photo.views_count, photo.downloads_count),
        (7, 100, 3)
    );
    assert!(photo.blob_url.is_none());
    assert_eq!(*recorded.auth.lock().unwrap(), vec!["Client-ID test-key"]);
    Ok(())
}

#[tokio::test]
async fn status_codes_map_to_source_errors() -> Result<()> {
    let (base, _) = spawn_mock().await?;
    let client = client(&base)?;

    assert!(matches!(
        client.fetch_by_id("missing").await,
        Err(SourceError::NotFound(id)) if id == "missing"
    ));
    assert!(matches!(
        client.fetch_by_id("limited").await,
        Err(SourceError::RateLimited)
    ));
    assert!(matches!(
        client.fetch_by_id("broken").await,
        Err(SourceError::Api { status: 502, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn search_sends_query_and_paging() -> Result<()> {
    let (base, recorded) = spawn_mock().await?;
    let client = client(&base)?;

    let photos = client
        .search("mountain lake", PageRequest { page: 2, per_page: 5 })
        .await?;

    let ids: Vec<_> = photos.iter().map(|p| p.external_id.as_str()).collect();
    assert_eq!(ids, ["s1", "s2"]);
    let queries = recorded.queries.lock().unwrap();
    assert_eq!(queries[0]["query"], "mountain lake");
    assert_eq!(queries[0]["page"], "2");
    assert_eq!(queries[0]["per_page"], "5");
    Ok(())
}

#[tokio::test]
async fn list_new_reads_bare_array() -> Result<()> {
    let (base, _) = spawn_mock().await?;
    let client = client(&base)?;

    let photos = client
        .list_new(PageRequest { page: 1, per_page: 10 })
        .await?;

    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].external_id, "n1");
    Ok(())
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let client = client(&format!("http://{addr}"))?;
    assert!(matches!(
        client.fetch_by_id("abc").await,
        Err(SourceError::Network(_))
    ));
    Ok(())
}
