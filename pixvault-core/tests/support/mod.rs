//! In-memory collaborators for engine, queue and worker tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use pixvault_core::{
    IngestionEngine,
    domain::{
        AccountId, BinaryFetcher, BlobKey, BlobStore, FetchedBinary,
        PageRequest, Photo, PhotoId, PhotoSource, PhotoStore, SaveOutcome,
        StoredBlob,
    },
    error::{BlobError, DownloadError, SourceError, StoreError},
};

pub const BLOB_BASE_URL: &str = "http://blobs.test";

/// Upstream photo with deterministic metadata.
pub fn upstream_photo(external_id: &str) -> Photo {
    let mut photo =
        Photo::new(external_id, format!("https://images.test/{external_id}"));
    photo.title = format!("{external_id} title");
    photo.description = format!("{external_id} description");
    photo.author_name = "Test Author".into();
    photo.width = 640;
    photo.height = 480;
    photo
}

#[derive(Default)]
pub struct ScriptedSource {
    photos: Mutex<HashMap<String, Photo>>,
    search_results: Mutex<Vec<Photo>>,
    latest: Mutex<Vec<Photo>>,
    pub fetch_calls: AtomicUsize,
    pub searches: Mutex<Vec<(String, PageRequest)>>,
    pub fail_search: AtomicBool,
    pub search_delay: Mutex<Option<Duration>>,
    active_searches: AtomicUsize,
    /// Highest number of searches observed running at once.
    pub peak_searches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_photo(self, photo: Photo) -> Self {
        self.photos
            .lock()
            .unwrap()
            .insert(photo.external_id.clone(), photo);
        self
    }

    pub fn with_search_results(self, results: Vec<Photo>) -> Self {
        *self.search_results.lock().unwrap() = results;
        self
    }

    pub fn with_latest(self, results: Vec<Photo>) -> Self {
        *self.latest.lock().unwrap() = results;
        self
    }

    pub fn with_search_delay(self, delay: Duration) -> Self {
        *self.search_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn recorded_searches(&self) -> Vec<(String, PageRequest)> {
        self.searches.lock().unwrap().clone()
    }
}

#[async_trait]
impl PhotoSource for ScriptedSource {
    async fn fetch_by_id(
        &self,
        external_id: &str,
    ) -> Result<Photo, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.photos
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            // Each fetch yields a fresh record, like a real API response.
            .map(|photo| Photo {
                id: PhotoId::new(),
                ..photo
            })
            .ok_or_else(|| SourceError::NotFound(external_id.to_string()))
    }

    async fn search(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError> {
        self.searches
            .lock()
            .unwrap()
            .push((query.to_string(), page));
        let running = self.active_searches.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_searches.fetch_max(running, Ordering::SeqCst);
        let delay = *self.search_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active_searches.fetch_sub(1, Ordering::SeqCst);
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(SourceError::Api {
                status: 503,
                message: "upstream unavailable".into(),
            });
        }
        Ok(self
            .search_results
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|photo| Photo {
                id: PhotoId::new(),
                ..photo
            })
            .collect())
    }

    async fn list_new(
        &self,
        _page: PageRequest,
    ) -> Result<Vec<Photo>, SourceError> {
        Ok(self.latest.lock().unwrap().clone())
    }
}

/// Fetcher returning the URL bytes, with per-URL failure injection.
#[derive(Default)]
pub struct StubFetcher {
    transport_failures: Mutex<HashSet<String>>,
    status_failures: Mutex<HashMap<String, u16>>,
    pub calls: AtomicUsize,
    pub content_type: Mutex<Option<String>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        let fetcher = Self::default();
        *fetcher.content_type.lock().unwrap() = Some("image/jpeg".into());
        fetcher
    }

    pub fn fail_transport(&self, url: &str) {
        self.transport_failures
            .lock()
            .unwrap()
            .insert(url.to_string());
    }

    pub fn fail_status(&self, url: &str, status: u16) {
        self.status_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), status);
    }
}

#[async_trait]
impl BinaryFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedBinary, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.transport_failures.lock().unwrap().contains(url) {
            return Err(DownloadError::Transport {
                url: url.to_string(),
                message: "connection reset by peer".into(),
            });
        }
        if let Some(status) = self.status_failures.lock().unwrap().get(url) {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: *status,
            });
        }
        Ok(FetchedBinary {
            bytes: url.as_bytes().to_vec(),
            content_type: self.content_type.lock().unwrap().clone(),
        })
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, StoredBlob>>,
    failing_keys: Mutex<HashSet<String>>,
    pub uploads: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_key(&self, key: &BlobKey) {
        self.failing_keys
            .lock()
            .unwrap()
            .insert(key.as_str().to_string());
    }

    pub fn object(&self, key: &BlobKey) -> Option<StoredBlob> {
        self.objects.lock().unwrap().get(key.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        key: &BlobKey,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if self.failing_keys.lock().unwrap().contains(key.as_str()) {
            return Err(BlobError::Backend("bucket unavailable".into()));
        }
        self.objects.lock().unwrap().insert(
            key.as_str().to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{BLOB_BASE_URL}/{key}"))
    }

    async fn get(&self, key: &BlobKey) -> Result<StoredBlob, BlobError> {
        self.object(key)
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), BlobError> {
        self.objects.lock().unwrap().remove(key.as_str());
        Ok(())
    }
}

/// Photo store keyed by external id with a unique constraint like the
/// Postgres table.
#[derive(Default)]
pub struct MemoryPhotoStore {
    photos: Mutex<Vec<Photo>>,
    system_account: Mutex<Option<AccountId>>,
    failing_saves: Mutex<HashSet<String>>,
    pub fail_lookups: AtomicBool,
    pub fail_accounts: AtomicBool,
    pub saves: AtomicUsize,
    pub account_calls: AtomicUsize,
}

impl MemoryPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_save(&self, external_id: &str) {
        self.failing_saves
            .lock()
            .unwrap()
            .insert(external_id.to_string());
    }

    /// Insert directly, bypassing failure injection.
    pub fn seed(&self, photo: Photo) {
        self.photos.lock().unwrap().push(photo);
    }

    pub fn all(&self) -> Vec<Photo> {
        self.photos.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.photos.lock().unwrap().len()
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn save(&self, photo: &Photo) -> Result<SaveOutcome, StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_saves
            .lock()
            .unwrap()
            .contains(&photo.external_id)
        {
            return Err(StoreError::Backend("insert rejected".into()));
        }
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
        Ok(self
            .photos
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Photo>, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("lookup timed out".into()));
        }
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
        let mut hits: Vec<Photo> = self
            .photos
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                p.title.to_lowercase().contains(&needle)
                    || p.description.to_lowercase().contains(&needle)
                    || p.author_name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(paginate(hits, page))
    }

    async fn list_recent(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError> {
        let mut photos = self.all();
        photos.reverse();
        Ok(paginate(photos, page))
    }

    async fn get_or_create_system_account(
        &self,
    ) -> Result<AccountId, StoreError> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_accounts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("accounts table locked".into()));
        }
        Ok(*self
            .system_account
            .lock()
            .unwrap()
            .get_or_insert_with(AccountId::new))
    }
}

fn paginate(photos: Vec<Photo>, page: PageRequest) -> Vec<Photo> {
    photos
        .into_iter()
        .skip(page.offset() as usize)
        .take(page.limit() as usize)
        .collect()
}

/// An engine wired to fresh doubles.
pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub fetcher: Arc<StubFetcher>,
    pub blobs: Arc<MemoryBlobStore>,
    pub store: Arc<MemoryPhotoStore>,
    pub engine: Arc<IngestionEngine>,
}

impl Harness {
    pub fn new(source: ScriptedSource) -> Self {
        let source = Arc::new(source);
        let fetcher = Arc::new(StubFetcher::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(MemoryPhotoStore::new());
        let engine = Arc::new(IngestionEngine::new(
            source.clone(),
            fetcher.clone(),
            blobs.clone(),
            store.clone(),
        ));
        Self {
            source,
            fetcher,
            blobs,
            store,
            engine,
        }
    }
}
