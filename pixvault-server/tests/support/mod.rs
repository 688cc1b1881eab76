//! Test application wired to in-memory collaborators and a temporary
//! cacache blob root.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum_test::TestServer;
use pixvault_core::{
    AdmissionGate, IngestionEngine, WorkQueue,
    domain::{
        AccountId, BinaryFetcher, FetchedBinary, PageRequest, Photo, PhotoId,
        PhotoSource, PhotoStore, SaveOutcome,
    },
    error::{DownloadError, SourceError, StoreError},
    infra::CacheBlobStore,
    queue::{InMemoryQueueBroker, QueueConfig},
};
use pixvault_server::{
    AppState, create_app,
    infra::config::{AdmissionConfig, Config},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const BLOB_BASE_URL: &str = "http://localhost/blobs";

pub fn upstream_photo(external_id: &str) -> Photo {
    let mut photo =
        Photo::new(external_id, format!("https://images.test/{external_id}"));
    photo.title = format!("{external_id} over the lake");
    photo.author_name = "Test Author".into();
    photo.width = 640;
    photo.height = 480;
    photo
}

/// Catalog double: known photos by id plus one canned result page.
#[derive(Default)]
pub struct CatalogSource {
    photos: Mutex<HashMap<String, Photo>>,
    results: Mutex<Vec<Photo>>,
    pub searches: Mutex<Vec<String>>,
}

impl CatalogSource {
    pub fn with_photo(self, photo: Photo) -> Self {
        self.photos
            .lock()
            .unwrap()
            .insert(photo.external_id.clone(), photo);
        self
    }

    pub fn with_results(self, results: Vec<Photo>) -> Self {
        *self.results.lock().unwrap() = results;
        self
    }
}

#[async_trait]
impl PhotoSource for CatalogSource {
    async fn fetch_by_id(
        &self,
        external_id: &str,
    ) -> Result<Photo, SourceError> {
        self.photos
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(external_id.to_string()))
    }

    async fn search(
        &self,
        query: &str,
        _page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError> {
        self.searches.lock().unwrap().push(query.to_string());
        Ok(self.results.lock().unwrap().clone())
    }

    async fn list_new(
        &self,
        _page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError> {
        Ok(self.results.lock().unwrap().clone())
    }
}

/// Serves every URL as a small JPEG-typed body.
#[derive(Default)]
pub struct JpegFetcher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl BinaryFetcher for JpegFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBinary, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedBinary {
            bytes: format!("jpeg:{url}").into_bytes(),
            content_type: Some("image/jpeg".into()),
        })
    }
}

#[derive(Default)]
pub struct MemoryPhotoStore {
    photos: Mutex<Vec<Photo>>,
    account: Mutex<Option<AccountId>>,
}

impl MemoryPhotoStore {
    pub fn seed(&self, photo: Photo) {
        self.photos.lock().unwrap().push(photo);
    }

    pub fn count(&self) -> usize {
        self.photos.lock().unwrap().len()
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn save(&self, photo: &Photo) -> Result<SaveOutcome, StoreError> {
        let mut photos = self.photos.lock().unwrap();
        if photos.iter().any(|p| p.external_id == photo.external_id) {
            return Ok(SaveOutcome::AlreadyExists);
        }
        photos.push(photo.clone());
        Ok(SaveOutcome::Inserted)
    }

    async fn get_by_internal_id(
        &self,
        id: PhotoId,
    ) -> Result<Option<Photo>, StoreError> {
        Ok(self.photos.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Photo>, StoreError> {
        Ok(self
            .photos
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.external_id == external_id)
            .cloned())
    }

    async fn search(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError> {
        let needle = query.to_lowercase();
        Ok(self
            .photos
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.title.to_lowercase().contains(&needle))
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect())
    }

    async fn list_recent(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError> {
        Ok(self
            .photos
            .lock()
            .unwrap()
            .iter()
            .rev()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect())
    }

    async fn get_or_create_system_account(
        &self,
    ) -> Result<AccountId, StoreError> {
        Ok(*self.account.lock().unwrap().get_or_insert_with(AccountId::new))
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub source: Arc<CatalogSource>,
    pub fetcher: Arc<JpegFetcher>,
    pub store: Arc<MemoryPhotoStore>,
    pub broker: Arc<InMemoryQueueBroker>,
    _blob_root: TempDir,
}

pub struct TestAppBuilder {
    source: CatalogSource,
    admission: AdmissionConfig,
}

impl TestAppBuilder {
    pub fn source(mut self, source: CatalogSource) -> Self {
        self.source = source;
        self
    }

    pub fn admission(mut self, capacity: usize, search_wait_ms: u64) -> Self {
        self.admission = AdmissionConfig {
            capacity,
            search_wait_ms,
        };
        self
    }

    pub fn build(self) -> Result<TestApp> {
        let blob_root = tempfile::tempdir()?;
        let source = Arc::new(self.source);
        let fetcher = Arc::new(JpegFetcher::default());
        let store = Arc::new(MemoryPhotoStore::default());
        let blobs =
            Arc::new(CacheBlobStore::new(blob_root.path(), BLOB_BASE_URL));
        let engine = Arc::new(IngestionEngine::new(
            source.clone(),
            fetcher.clone(),
            blobs.clone(),
            store.clone(),
        ));
        let broker =
            Arc::new(InMemoryQueueBroker::new(QueueConfig::default()));

        let config = Config {
            admission: self.admission,
            dev_mode: true,
            ..Config::default()
        };
        let state = AppState {
            gate: AdmissionGate::new(config.admission.capacity),
            config: Arc::new(config),
            engine,
            store: store.clone(),
            blobs,
            queue: WorkQueue::new(broker.clone()),
            database: None,
            shutdown: CancellationToken::new(),
        };

        let server = TestServer::new(create_app(state.clone()))
            .map_err(|err| anyhow!(err.to_string()))?;

        Ok(TestApp {
            server,
            state,
            source,
            fetcher,
            store,
            broker,
            _blob_root: blob_root,
        })
    }
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            source: CatalogSource::default(),
            admission: AdmissionConfig::default(),
        }
    }
}
