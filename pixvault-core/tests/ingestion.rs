mod support;

use std::sync::atomic::Ordering;

use anyhow::Result;
use pixvault_core::{
    IngestError,
    domain::{BlobKey, PageRequest},
    ingest::FailureKind,
};

use support::{BLOB_BASE_URL, Harness, ScriptedSource, upstream_photo};

#[tokio::test]
async fn resolve_ingests_once_then_serves_from_store() -> Result<()> {
    let harness =
        Harness::new(ScriptedSource::new().with_photo(upstream_photo("abc")));

    let first = harness.engine.resolve_by_external_id("abc").await?;
    let second = harness.engine.resolve_by_external_id("abc").await?;

    assert_eq!(first.id, second.id);
    assert_eq!(
        first.blob_url.as_deref(),
        Some(format!("{BLOB_BASE_URL}/unsplash-photos/abc").as_str())
    );
    assert!(first.owner_id.is_some());
    assert_eq!(harness.source.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.blobs.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(harness.store.count(), 1);

    let stored = harness
        .blobs
        .object(&BlobKey::for_external_id("abc"))
        .expect("binary uploaded");
    assert_eq!(stored.content_type, "image/jpeg");
    assert_eq!(stored.bytes, b"https://images.test/abc");

    let stats = harness.engine.stats().snapshot();
    assert_eq!(stats.ingested, 1);
    assert_eq!(stats.resolved_from_store, 1);
    Ok(())
}

#[tokio::test]
async fn resolve_unknown_photo_is_source_not_found() {
    let harness = Harness::new(ScriptedSource::new());

    let err = harness
        .engine
        .resolve_by_external_id("missing")
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::SourceNotFound { .. }));
    assert_eq!(harness.blobs.uploads.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness
            .engine
            .stats()
            .snapshot()
            .failures_of(FailureKind::SourceNotFound),
        1
    );
}

#[tokio::test]
async fn resolve_dedup_lookup_failure_stops_before_fetch() {
    let harness =
        Harness::new(ScriptedSource::new().with_photo(upstream_photo("abc")));
    harness.store.fail_lookups.store(true, Ordering::SeqCst);

    let err = harness
        .engine
        .resolve_by_external_id("abc")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::DedupLookupFailed);
    assert_eq!(harness.source.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resolve_distinguishes_download_failures() {
    let harness = Harness::new(
        ScriptedSource::new()
            .with_photo(upstream_photo("gone"))
            .with_photo(upstream_photo("flaky")),
    );
    harness.fetcher.fail_status("https://images.test/gone", 404);
    harness.fetcher.fail_transport("https://images.test/flaky");

    let gone = harness.engine.resolve_by_external_id("gone").await;
    let flaky = harness.engine.resolve_by_external_id("flaky").await;

    assert_eq!(
        gone.unwrap_err().kind(),
        FailureKind::UnexpectedDownloadStatus
    );
    assert_eq!(flaky.unwrap_err().kind(), FailureKind::BinaryDownloadFailed);
    assert_eq!(harness.store.count(), 0);
}

#[tokio::test]
async fn resolve_blob_and_persist_failures_are_classified() {
    let harness = Harness::new(
        ScriptedSource::new()
            .with_photo(upstream_photo("noblob"))
            .with_photo(upstream_photo("nosave")),
    );
    harness.blobs.fail_key(&BlobKey::for_external_id("noblob"));
    harness.store.fail_save("nosave");

    let noblob = harness.engine.resolve_by_external_id("noblob").await;
    let nosave = harness.engine.resolve_by_external_id("nosave").await;

    assert_eq!(noblob.unwrap_err().kind(), FailureKind::BlobUploadFailed);
    assert_eq!(nosave.unwrap_err().kind(), FailureKind::PersistFailed);
    // The blob for the failed save stays; a retry overwrites the same key.
    assert!(
        harness
            .blobs
            .object(&BlobKey::for_external_id("nosave"))
            .is_some()
    );
}

#[tokio::test]
async fn resolve_account_failure_is_reported() {
    let harness =
        Harness::new(ScriptedSource::new().with_photo(upstream_photo("abc")));
    harness.store.fail_accounts.store(true, Ordering::SeqCst);

    let err = harness
        .engine
        .resolve_by_external_id("abc")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::AccountResolutionFailed);
    assert_eq!(harness.store.count(), 0);
}

#[tokio::test]
async fn resolve_missing_content_type_falls_back_to_octet_stream() -> Result<()> {
    let harness =
        Harness::new(ScriptedSource::new().with_photo(upstream_photo("abc")));
    *harness.fetcher.content_type.lock().unwrap() = Some("  ".into());

    harness.engine.resolve_by_external_id("abc").await?;

    let stored = harness
        .blobs
        .object(&BlobKey::for_external_id("abc"))
        .expect("binary uploaded");
    assert_eq!(stored.content_type, "application/octet-stream");
    Ok(())
}

#[tokio::test]
async fn concurrent_resolves_agree_on_one_record() -> Result<()> {
    let harness =
        Harness::new(ScriptedSource::new().with_photo(upstream_photo("abc")));

    let (a, b) = tokio::join!(
        harness.engine.resolve_by_external_id("abc"),
        harness.engine.resolve_by_external_id("abc"),
    );

    assert_eq!(a?.id, b?.id);
    assert_eq!(harness.store.count(), 1);
    Ok(())
}

#[tokio::test]
async fn search_reuses_stored_photos() -> Result<()> {
    let harness = Harness::new(ScriptedSource::new().with_search_results(vec![
        upstream_photo("a"),
        upstream_photo("b"),
    ]));

    let first = harness.engine.search_and_persist("lake", 1, 2).await?;
    let second = harness.engine.search_and_persist("lake", 1, 2).await?;

    assert_eq!(first.len(), 2);
    let first_ids: Vec<_> = first.iter().map(|p| p.id).collect();
    let second_ids: Vec<_> = second.iter().map(|p| p.id).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(harness.blobs.uploads.load(Ordering::SeqCst), 2);
    assert_eq!(harness.store.count(), 2);
    Ok(())
}

#[tokio::test]
async fn search_skips_failed_items_and_keeps_order() -> Result<()> {
    let harness = Harness::new(ScriptedSource::new().with_search_results(vec![
        upstream_photo("one"),
        upstream_photo("two"),
        upstream_photo("three"),
    ]));
    harness.fetcher.fail_transport("https://images.test/two");

    let report = harness
        .engine
        .search_and_persist_report("lake", 1, 3)
        .await?;

    let ids: Vec<_> =
        report.photos.iter().map(|p| p.external_id.as_str()).collect();
    assert_eq!(ids, ["one", "three"]);
    assert_eq!(report.found, 3);
    assert_eq!(report.ingested, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].external_id, "two");
    assert_eq!(report.skipped[0].kind, FailureKind::BinaryDownloadFailed);
    assert!(!report.is_complete());

    let stats = harness.engine.stats().snapshot();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failures_of(FailureKind::BinaryDownloadFailed), 1);
    assert_eq!(
        stats.recent_failures[0].external_id.as_deref(),
        Some("two")
    );
    Ok(())
}

#[tokio::test]
async fn search_skips_items_whose_dedup_lookup_fails() -> Result<()> {
    let harness = Harness::new(
        ScriptedSource::new().with_search_results(vec![upstream_photo("a")]),
    );
    harness.store.fail_lookups.store(true, Ordering::SeqCst);

    let report = harness.engine.search_and_persist_report("x", 1, 1).await?;

    assert!(report.photos.is_empty());
    assert_eq!(report.skipped[0].kind, FailureKind::DedupLookupFailed);
    assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn search_normalizes_non_positive_paging() -> Result<()> {
    let harness = Harness::new(ScriptedSource::new());

    harness.engine.search_and_persist("lake", 0, 0).await?;
    harness.engine.search_and_persist("lake", 1, 3).await?;
    harness.engine.search_and_persist("lake", -2, 250).await?;

    let searches = harness.source.recorded_searches();
    assert_eq!(searches[0].1, PageRequest { page: 1, per_page: 3 });
    assert_eq!(searches[0], searches[1]);
    assert_eq!(searches[2].1, PageRequest { page: 1, per_page: 250 });
    Ok(())
}

#[tokio::test]
async fn empty_search_returns_empty_without_side_effects() -> Result<()> {
    let harness = Harness::new(ScriptedSource::new());

    let photos = harness.engine.search_and_persist("nothing", 1, 3).await?;

    assert!(photos.is_empty());
    assert_eq!(harness.store.account_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.engine.stats().snapshot().batches, 1);
    Ok(())
}

#[tokio::test]
async fn search_source_failure_fails_the_batch() {
    let harness = Harness::new(
        ScriptedSource::new().with_search_results(vec![upstream_photo("a")]),
    );
    harness.source.fail_search.store(true, Ordering::SeqCst);

    let err = harness
        .engine
        .search_and_persist("lake", 1, 3)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::SourceFetchFailed);
    assert_eq!(harness.store.count(), 0);
}

#[tokio::test]
async fn search_account_failure_fails_the_batch() {
    let harness = Harness::new(
        ScriptedSource::new().with_search_results(vec![upstream_photo("a")]),
    );
    harness.store.fail_accounts.store(true, Ordering::SeqCst);

    let err = harness
        .engine
        .search_and_persist("lake", 1, 3)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::AccountResolutionFailed);
    assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn batch_resolves_the_system_account_once() -> Result<()> {
    let harness = Harness::new(ScriptedSource::new().with_search_results(vec![
        upstream_photo("a"),
        upstream_photo("b"),
        upstream_photo("c"),
    ]));

    let photos = harness.engine.search_and_persist("lake", 1, 3).await?;

    assert_eq!(harness.store.account_calls.load(Ordering::SeqCst), 1);
    let owner = photos[0].owner_id;
    assert!(photos.iter().all(|p| p.owner_id == owner));
    Ok(())
}

#[tokio::test]
async fn duplicate_ids_within_one_batch_store_one_record() -> Result<()> {
    let harness = Harness::new(ScriptedSource::new().with_search_results(vec![
        upstream_photo("a"),
        upstream_photo("a"),
    ]));

    let report = harness.engine.search_and_persist_report("x", 1, 2).await?;

    assert_eq!(report.photos.len(), 2);
    assert_eq!(report.photos[0].id, report.photos[1].id);
    assert_eq!((report.ingested, report.reused), (1, 1));
    assert_eq!(harness.store.count(), 1);
    Ok(())
}

#[tokio::test]
async fn latest_listing_uses_the_same_pipeline() -> Result<()> {
    let harness = Harness::new(
        ScriptedSource::new()
            .with_latest(vec![upstream_photo("new1"), upstream_photo("new2")]),
    );

    let report = harness.engine.ingest_latest(0, 0).await?;

    assert_eq!(report.ingested, 2);
    assert!(report.photos.iter().all(|p| p.is_ingested()));
    Ok(())
}
