//! Wiring of the production adapters from a loaded [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use pixvault_core::{
    AdmissionGate, IngestionEngine, MIGRATOR, WorkQueue,
    infra::{
        CacheBlobStore, HttpBinaryFetcher, PostgresPhotoStore, UnsplashClient,
        UnsplashSettings,
    },
    queue::{InMemoryQueueBroker, PostgresQueueBroker, QueueBroker},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::infra::{
    app_state::AppState,
    config::{Config, QueueBackend},
};

/// Connect, migrate and build the shared state every process mode runs on.
pub async fn build_state(
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<AppState> {
    let pool = connect(&config).await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied");

    let store = Arc::new(PostgresPhotoStore::new(pool.clone()));
    let blobs = Arc::new(CacheBlobStore::new(
        config.blobs.root.clone(),
        config.blob_public_url(),
    ));
    let source = Arc::new(unsplash_client(&config)?);
    let fetcher = Arc::new(
        HttpBinaryFetcher::new()
            .context("failed to build the download client")?,
    );
    let engine = Arc::new(IngestionEngine::new(
        source,
        fetcher,
        blobs.clone(),
        store.clone(),
    ));

    let broker: Arc<dyn QueueBroker> = match config.queue.backend {
        QueueBackend::Postgres => Arc::new(
            PostgresQueueBroker::new(
                pool.clone(),
                config.queue.broker.clone(),
            )
            .await
            .context("failed to start the Postgres queue broker")?,
        ),
        QueueBackend::Memory => {
            warn!("using the in-memory queue broker");
            Arc::new(InMemoryQueueBroker::new(config.queue.broker.clone()))
        }
    };
    let queue = WorkQueue::new(broker)
        .with_publish_timeout(config.queue.broker.publish_timeout());

    let gate = AdmissionGate::new(config.admission.capacity);
    info!(
        admission.capacity = gate.capacity(),
        queue.name = %queue.name(),
        queue.backend = ?config.queue.backend,
        queue.max_attempts = config.queue.broker.max_attempts,
        blobs.root = %config.blobs.root.display(),
        "runtime wired"
    );

    Ok(AppState {
        config,
        engine,
        store,
        blobs,
        queue,
        gate,
        database: Some(pool),
        shutdown,
    })
}

fn unsplash_client(config: &Config) -> Result<UnsplashClient> {
    let key = config.unsplash.access_key.clone().unwrap_or_default();
    UnsplashClient::new(
        UnsplashSettings::new(key).with_base_url(config.unsplash.base_url.clone()),
    )
    .context("failed to build the Unsplash client; is UNSPLASH_API_KEY set?")
}

pub fn database_url(config: &Config) -> Result<&str> {
    config.database.url.as_deref().ok_or_else(|| {
        anyhow!("DATABASE_URL or database.url must be provided for PostgreSQL connections")
    })
}

pub async fn connect(config: &Config) -> Result<PgPool> {
    let url = database_url(config)?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    info!("connected to PostgreSQL");
    Ok(pool)
}

/// Connectivity check plus a count of migrations not yet applied.
pub async fn preflight(pool: &PgPool) -> Result<usize> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("database health check failed")?;

    let ledger_exists: bool = sqlx::query_scalar(
        "SELECT to_regclass('_sqlx_migrations') IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;
    let applied: Vec<i64> = if ledger_exists {
        sqlx::query_scalar(
            "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version",
        )
        .fetch_all(pool)
        .await?
    } else {
        Vec::new()
    };

    let pending = MIGRATOR
        .iter()
        .filter(|migration| !applied.contains(&migration.version))
        .count();
    Ok(pending)
}
