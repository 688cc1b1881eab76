//! PostgreSQL implementation of [`PhotoStore`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    domain::{
        AccountId, PageRequest, Photo, PhotoId, PhotoStore,
        SYSTEM_ACCOUNT_USERNAME, SaveOutcome,
    },
    error::StoreError,
};

const SYSTEM_ACCOUNT_EMAIL: &str = "system@pixvault.local";

const PHOTO_COLUMNS: &str = "id, external_id, owner_id, blob_url, title, \
    description, author_name, width, height, likes_count, views_count, \
    downloads_count, source_url, uploaded_at, created_at, updated_at";

#[derive(FromRow)]
struct PhotoRow {
    id: Uuid,
    external_id: String,
    owner_id: Option<Uuid>,
    blob_url: String,
    title: String,
    description: String,
    author_name: String,
    width: i32,
    height: i32,
    likes_count: i64,
    views_count: i64,
    downloads_count: i64,
    source_url: String,
    uploaded_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PhotoRow> for Photo {
    fn from(row: PhotoRow) -> Self {
        Photo {
            id: PhotoId(row.id),
            external_id: row.external_id,
            owner_id: row.owner_id.map(AccountId),
            blob_url: Some(row.blob_url),
            title: row.title,
            description: row.description,
            author_name: row.author_name,
            width: row.width,
            height: row.height,
            likes_count: row.likes_count,
            views_count: row.views_count,
            downloads_count: row.downloads_count,
            source_url: row.source_url,
            uploaded_at: row.uploaded_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Photo metadata and accounts in PostgreSQL.
#[derive(Clone)]
pub struct PostgresPhotoStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresPhotoStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresPhotoStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresPhotoStore {
    /// Store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `SELECT 1` round trip.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PhotoStore for PostgresPhotoStore {
    async fn save(&self, photo: &Photo) -> Result<SaveOutcome, StoreError> {
        let blob_url = photo.blob_url.as_deref().ok_or_else(|| {
            StoreError::Backend(format!(
                "photo {} has no blob URL; upload the binary first",
                photo.external_id
            ))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO photos (
                id, external_id, owner_id, blob_url, title, description,
                author_name, width, height, likes_count, views_count,
                downloads_count, source_url, uploaded_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(photo.id)
        .bind(&photo.external_id)
        .bind(photo.owner_id)
        .bind(blob_url)
        .bind(&photo.title)
        .bind(&photo.description)
        .bind(&photo.author_name)
        .bind(photo.width)
        .bind(photo.height)
        .bind(photo.likes_count)
        .bind(photo.views_count)
        .bind(photo.downloads_count)
        .bind(&photo.source_url)
        .bind(photo.uploaded_at)
        .bind(photo.created_at)
        .bind(photo.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(external_id = %photo.external_id, "photo already stored");
            Ok(SaveOutcome::AlreadyExists)
        } else {
            Ok(SaveOutcome::Inserted)
        }
    }

    async fn get_by_internal_id(
        &self,
        id: PhotoId,
    ) -> Result<Option<Photo>, StoreError> {
        let row = sqlx::query_as::<_, PhotoRow>(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Photo::from))
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Photo>, StoreError> {
        let row = sqlx::query_as::<_, PhotoRow>(&format!(
            "SELECT {PHOTO_COLUMNS} FROM photos WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Photo::from))
    }

    async fn search(
        &self,
        query: &str,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let rows = sqlx::query_as::<_, PhotoRow>(&format!(
            r#"
            SELECT {PHOTO_COLUMNS}
            FROM photos
            WHERE title ILIKE $1 OR description ILIKE $1 OR author_name ILIKE $1
            ORDER BY uploaded_at DESC, id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(pattern)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Photo::from).collect())
    }

    async fn list_recent(
        &self,
        page: PageRequest,
    ) -> Result<Vec<Photo>, StoreError> {
        let rows = sqlx::query_as::<_, PhotoRow>(&format!(
            r#"
            SELECT {PHOTO_COLUMNS}
            FROM photos
            ORDER BY created_at DESC, id
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Photo::from).collect())
    }

    async fn get_or_create_system_account(
        &self,
    ) -> Result<AccountId, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, username, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (username) DO NOTHING
            "#,
        )
        .bind(AccountId::new())
        .bind(SYSTEM_ACCOUNT_USERNAME)
        .bind(SYSTEM_ACCOUNT_EMAIL)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(username = SYSTEM_ACCOUNT_USERNAME, "created system account");
        }

        let id: Uuid =
            sqlx::query_scalar("SELECT id FROM accounts WHERE username = $1")
                .bind(SYSTEM_ACCOUNT_USERNAME)
                .fetch_one(&self.pool)
                .await?;
        Ok(AccountId(id))
    }
}

/// Escape `%`, `_` and `\` so user input matches literally in `ILIKE`.
fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
