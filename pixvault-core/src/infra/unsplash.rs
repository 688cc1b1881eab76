//! Unsplash API adapter for [`PhotoSource`].

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    domain::{PageRequest, Photo, PhotoSource, photo::store_precision},
    error::SourceError,
};

/// Public Unsplash API endpoint.
pub const UNSPLASH_BASE_URL: &str = "https://api.unsplash.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for [`UnsplashClient`].
#[derive(Clone)]
pub struct UnsplashSettings {
    /// Client-ID access key.
    pub access_key: String,
    /// API root, without trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl UnsplashSettings {
    /// Settings for the public API.
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            base_url: UNSPLASH_BASE_URL.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Point at another API root.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl fmt::Debug for UnsplashSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsplashSettings")
            .field("access_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct UnsplashUrls {
    #[serde(default)]
    full: String,
    #[serde(default)]
    raw: String,
}

#[derive(Debug, Deserialize)]
struct UnsplashUser {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct UnsplashPhoto {
    id: String,
    description: Option<String>,
    alt_description: Option<String>,
    #[serde(default)]
    width: i32,
    #[serde(default)]
    height: i32,
    #[serde(default)]
    likes: i64,
    views: Option<i64>,
    downloads: Option<i64>,
    urls: UnsplashUrls,
    user: UnsplashUser,
    created_at: DateTime<Utc>,
}

impl UnsplashPhoto {
    fn into_photo(self) -> Photo {
        let description = self
            .description
            .filter(|text| !text.is_empty())
            .or(self.alt_description)
            .unwrap_or_default();
        let source_url = if self.urls.full.is_empty() {
            self.urls.raw
        } else {
            self.urls.full
        };

        let mut photo = Photo::new(self.id, source_url);
        photo.title = description.clone();
        photo.description = description;
        photo.author_name = self.user.name;
        photo.width = self.width;
        photo.height = self.height;
        photo.likes_count = self.likes;
        photo.views_count = self.views.unwrap_or(0);
        photo.downloads_count = self.downloads.unwrap_or(0);
        photo.uploaded_at = store_precision(self.created_at);
        photo
    }
}

#[derive(Debug, Deserialize)]
struct UnsplashSearchResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    results: Vec<UnsplashPhoto>,
}

/// Read-only client for the Unsplash REST API.
#[derive(Clone)]
pub struct UnsplashClient {
    client: Client,
    base_url: Url,
    access_key: String,
}

impl fmt::Debug for UnsplashClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsplashClient")
            .field("base_url", &self.base_url.as_str())
            .field("access_key", &"<redacted>")
            .finish()
    }
}

impl UnsplashClient {
    /// Build the client; an empty access key is rejected.
    pub fn new(settings: UnsplashSettings) -> Result<Self, SourceError> {
        if settings.access_key.trim().is_empty() {
            return Err(SourceError::Config(
                "Unsplash access key is empty".into(),
            ));
        }
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            SourceError::Config(format!(
                "invalid Unsplash base URL {}: {e}",
                settings.base_url
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SourceError::Config(format!(
                "Unsplash base URL {} cannot carry a path",
                settings.base_url
            )));
        }
        let client = Client::builder().timeout(settings.timeout).build()?;

        Ok(Self {
            client,
            base_url,
            access_key: settings.access_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        debug!(endpoint = %url.path(), "requesting Unsplash API");
        let response = self
            .client
            .get(url.clone())
            .query(query)
            .header("Authorization", format!("Client-ID {}", self.access_key))
            .header("Accept-Version", "v1")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                endpoint = %url.path(),
                status = status.as_u16(),
                body = %body,
                "Unsplash API returned an error"
            );
            return Err(match status {
                StatusCode::NOT_FOUND => SourceError::NotFound(url.path().to_string()),
                StatusCode::UNAUTHORIZED => SourceError::InvalidApiKey,
                StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                    SourceError::RateLimited
                }
                other => SourceError::Api {
                    status: other.as_u16(),
                    message: body,
                },
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| SourceError::Parse(e.to_string()))
    }

    fn page_query(page: PageRequest) -> [(&'static str, String); 2] {
        [
            ("page", page.page.to_string()),
            ("per_page", page.per_page.to_string()),
        ]
    }
}

#[async_trait]
impl PhotoSource for UnsplashClient {
    async fn fetch_by_id(
        &self,
        external_id: &str,
    ) -> Result<Photo, SourceError> {
        info!(external_id, "fetching photo from Unsplash");
        let url = self.endpoint(&["photos", external_id]);
        match self.get_json::<UnsplashPhoto>(url, &[]).await {
            Ok(photo) => Ok(photo.into_photo()),
            Err(SourceError::NotFound(_)) => {
                Err(SourceError::NotFound(external_id.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn search(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError> {
        let url = self.endpoint(&["search", "photos"]);
        let [page_param, per_page_param] = Self::page_query(page);
        let params = [("query", query.to_string()), page_param, per_page_param];

        let response: UnsplashSearchResponse =
            self.get_json(url, &params).await?;
        info!(
            query,
            total = response.total,
            count = response.results.len(),
            "Unsplash search finished"
        );
        Ok(response
            .results
            .into_iter()
            .map(UnsplashPhoto::into_photo)
            .collect())
    }

    async fn list_new(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError> {
        let url = self.endpoint(&["photos"]);
        let photos: Vec<UnsplashPhoto> =
            self.get_json(url, &Self::page_query(page)).await?;
        info!(count = photos.len(), "Unsplash listing finished");
        Ok(photos.into_iter().map(UnsplashPhoto::into_photo).collect())
    }
}
