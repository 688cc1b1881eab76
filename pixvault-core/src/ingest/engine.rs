use std::{fmt, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    domain::{
        AccountId, BinaryFetcher, BlobStore, PageRequest, Photo, PhotoSource,
        PhotoStore, SaveOutcome,
    },
    error::{IngestError, Result, SourceError, StoreError},
    ingest::report::{IngestReport, IngestStats, SkippedItem},
};

/// Content type recorded when the origin does not announce one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How a single photo was resolved.
#[derive(Debug)]
enum Resolution {
    Existing(Photo),
    Ingested(Photo),
}

impl Resolution {
    fn into_photo(self) -> Photo {
        match self {
            Resolution::Existing(photo) | Resolution::Ingested(photo) => photo,
        }
    }
}

/// Orchestrates dedup lookup, upstream fetch, binary download, blob upload
/// and persistence.
///
/// The engine never retries; redelivery through the queue is the retry
/// mechanism for batch work, and callers of the single-photo path see the
/// error directly.
#[derive(Clone)]
pub struct IngestionEngine {
    source: Arc<dyn PhotoSource>,
    fetcher: Arc<dyn BinaryFetcher>,
    blobs: Arc<dyn BlobStore>,
    store: Arc<dyn PhotoStore>,
    stats: Arc<IngestStats>,
}

impl fmt::Debug for IngestionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionEngine")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl IngestionEngine {
    /// Engine over the given collaborators with fresh stats.
    pub fn new(
        source: Arc<dyn PhotoSource>,
        fetcher: Arc<dyn BinaryFetcher>,
        blobs: Arc<dyn BlobStore>,
        store: Arc<dyn PhotoStore>,
    ) -> Self {
        Self {
            source,
            fetcher,
            blobs,
            store,
            stats: Arc::new(IngestStats::new()),
        }
    }

    /// Share an externally owned counter set.
    pub fn with_stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Counters updated by this engine.
    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// Return the stored photo for `external_id`, ingesting it first when it
    /// is not known locally.
    pub async fn resolve_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Photo> {
        let resolved = self.resolve(external_id).await;
        if let Err(err) = &resolved {
            self.stats.record_failure(Some(external_id), err);
        }
        resolved
    }

    async fn resolve(&self, external_id: &str) -> Result<Photo> {
        if let Some(existing) = self.lookup(external_id).await? {
            debug!(external_id, photo_id = %existing.id, "photo served from store");
            self.stats.record_reused();
            return Ok(existing);
        }

        info!(external_id, "photo not stored yet; fetching from source");
        let mut photo =
            self.source
                .fetch_by_id(external_id)
                .await
                .map_err(|source| match source {
                    SourceError::NotFound(_) => IngestError::SourceNotFound {
                        external_id: external_id.to_string(),
                        source,
                    },
                    other => IngestError::SourceFetchFailed { source: other },
                })?;

        self.store_binary(&mut photo).await?;
        photo.owner_id = Some(self.system_account().await?);

        let photo = self.persist(photo).await?.into_photo();
        info!(
            external_id,
            photo_id = %photo.id,
            "photo ingested"
        );
        Ok(photo)
    }

    /// Search the source and ingest every result not yet stored.
    ///
    /// `page <= 0` becomes 1 and `per_page <= 0` becomes 3. Items that fail
    /// are skipped, so the result may be shorter than the source page.
    pub async fn search_and_persist(
        &self,
        query: &str,
        page: i32,
        per_page: i32,
    ) -> Result<Vec<Photo>> {
        self.search_and_persist_report(query, page, per_page)
            .await
            .map(|report| report.photos)
    }

    /// [`IngestionEngine::search_and_persist`] with the full batch report.
    pub async fn search_and_persist_report(
        &self,
        query: &str,
        page: i32,
        per_page: i32,
    ) -> Result<IngestReport> {
        let page = PageRequest::for_search(page, per_page);
        info!(
            query,
            page = page.page,
            per_page = page.per_page,
            "searching source"
        );

        let results = match self.source.search(query, page).await {
            Ok(results) => results,
            Err(source) => {
                let err = IngestError::SourceFetchFailed { source };
                self.stats.record_failure(None, &err);
                return Err(err);
            }
        };

        self.ingest_batch(results).await
    }

    /// Ingest the newest photos published upstream.
    pub async fn ingest_latest(
        &self,
        page: i32,
        per_page: i32,
    ) -> Result<IngestReport> {
        let page = PageRequest::for_search(page, per_page);
        info!(
            page = page.page,
            per_page = page.per_page,
            "listing newest source photos"
        );

        let results = match self.source.list_new(page).await {
            Ok(results) => results,
            Err(source) => {
                let err = IngestError::SourceFetchFailed { source };
                self.stats.record_failure(None, &err);
                return Err(err);
            }
        };

        self.ingest_batch(results).await
    }

    async fn ingest_batch(&self, results: Vec<Photo>) -> Result<IngestReport> {
        let mut report = IngestReport {
            found: results.len(),
            ..IngestReport::default()
        };

        if results.is_empty() {
            info!("source returned no photos");
            self.stats.record_batch(&report);
            return Ok(report);
        }

        // Resolved once so a batch never races itself creating the account.
        let owner = match self.system_account().await {
            Ok(owner) => owner,
            Err(err) => {
                self.stats.record_failure(None, &err);
                return Err(err);
            }
        };

        for candidate in results {
            let external_id = candidate.external_id.clone();
            match self.ingest_candidate(candidate, owner).await {
                Ok(Resolution::Existing(photo)) => {
                    report.reused += 1;
                    report.photos.push(photo);
                }
                Ok(Resolution::Ingested(photo)) => {
                    report.ingested += 1;
                    report.photos.push(photo);
                }
                Err(err) => {
                    warn!(
                        external_id = %external_id,
                        kind = %err.kind(),
                        error = %err,
                        "skipping photo"
                    );
                    self.stats.record_failure(Some(&external_id), &err);
                    report.skipped.push(SkippedItem {
                        external_id,
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            found = report.found,
            reused = report.reused,
            ingested = report.ingested,
            skipped = report.skipped.len(),
            "batch finished"
        );
        self.stats.record_batch(&report);
        Ok(report)
    }

    async fn ingest_candidate(
        &self,
        candidate: Photo,
        owner: AccountId,
    ) -> Result<Resolution> {
        if let Some(existing) = self.lookup(&candidate.external_id).await? {
            debug!(
                external_id = %existing.external_id,
                photo_id = %existing.id,
                "photo already stored"
            );
            self.stats.record_reused();
            return Ok(Resolution::Existing(existing));
        }

        let mut photo = candidate;
        self.store_binary(&mut photo).await?;
        photo.owner_id = Some(owner);
        self.persist(photo).await
    }

    async fn lookup(&self, external_id: &str) -> Result<Option<Photo>> {
        self.store
            .get_by_external_id(external_id)
            .await
            .map_err(|source| IngestError::DedupLookupFailed {
                external_id: external_id.to_string(),
                source,
            })
    }

    async fn system_account(&self) -> Result<AccountId> {
        self.store
            .get_or_create_system_account()
            .await
            .map_err(|source| IngestError::AccountResolutionFailed { source })
    }

    /// Download the source binary and upload it under the photo's blob key.
    async fn store_binary(&self, photo: &mut Photo) -> Result<()> {
        debug!(
            external_id = %photo.external_id,
            url = %photo.source_url,
            "downloading source binary"
        );
        let binary = self
            .fetcher
            .fetch(&photo.source_url)
            .await
            .map_err(IngestError::from_download)?;

        let content_type = binary
            .content_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let key = photo.blob_key();
        let url = self
            .blobs
            .upload(&key, binary.bytes, &content_type)
            .await
            .map_err(|source| IngestError::BlobUploadFailed {
                external_id: photo.external_id.clone(),
                source,
            })?;

        debug!(key = %key, url = %url, content_type, "binary uploaded");
        photo.blob_url = Some(url);
        Ok(())
    }

    async fn persist(&self, photo: Photo) -> Result<Resolution> {
        let persist_failed = |source: StoreError| IngestError::PersistFailed {
            external_id: photo.external_id.clone(),
            source,
        };

        match self.store.save(&photo).await.map_err(persist_failed)? {
            SaveOutcome::Inserted => {
                self.stats.record_ingested();
                Ok(Resolution::Ingested(photo))
            }
            SaveOutcome::AlreadyExists => {
                debug!(
                    external_id = %photo.external_id,
                    "concurrent ingest won; re-reading stored record"
                );
                let stored = self
                    .store
                    .get_by_external_id(&photo.external_id)
                    .await
                    .map_err(persist_failed)?
                    .ok_or_else(|| {
                        persist_failed(StoreError::Backend(format!(
                            "record for {} conflicted but cannot be read",
                            photo.external_id
                        )))
                    })?;
                self.stats.record_reused();
                Ok(Resolution::Existing(stored))
            }
        }
    }
}
