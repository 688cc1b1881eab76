use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known username of the sentinel account that owns ingested photos.
pub const SYSTEM_ACCOUNT_USERNAME: &str = "system_user";

/// Key prefix for photo binaries in the blob store.
pub const BLOB_KEY_PREFIX: &str = "unsplash-photos";

/// Internal photo identifier, assigned once when the record is first built.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[derive(sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct PhotoId(pub Uuid);

impl PhotoId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PhotoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PhotoId").field(&self.0).finish()
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an owning account.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable key for locating a photo binary within the blob store.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlobKey(String);

impl BlobKey {
    /// Wrap an existing key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key derived from the upstream id only, so repeated uploads of the same
    /// photo overwrite one object.
    pub fn for_external_id(external_id: &str) -> Self {
        Self(format!("{BLOB_KEY_PREFIX}/{external_id}"))
    }

    /// Key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlobKey").field(&self.0).finish()
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A photo as known to pixvault.
///
/// Records built from the upstream catalog carry no `blob_url` and no
/// `owner_id`; the engine fills both in before the record is saved, so a
/// persisted photo always points at its stored binary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    /// Internal identifier.
    pub id: PhotoId,
    /// Identifier assigned by the upstream catalog; unique across records.
    pub external_id: String,
    /// Owning account; set at ingestion.
    pub owner_id: Option<AccountId>,
    /// Where the stored binary is served; set at ingestion.
    pub blob_url: Option<String>,
    /// Title, may be empty.
    pub title: String,
    /// Description, may be empty.
    pub description: String,
    /// Photographer's display name.
    pub author_name: String,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
    /// Upstream like count.
    pub likes_count: i64,
    /// Upstream view count.
    pub views_count: i64,
    /// Upstream download count.
    pub downloads_count: i64,
    /// Location of the original asset at the catalog.
    pub source_url: String,
    /// When the photo was published upstream.
    pub uploaded_at: DateTime<Utc>,
    /// When the record was created here.
    pub created_at: DateTime<Utc>,
    /// Last modification of the record.
    pub updated_at: DateTime<Utc>,
}

impl Photo {
    /// Fresh, not yet ingested record for an upstream photo.
    pub fn new(
        external_id: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        let now = store_precision(Utc::now());
        Self {
            id: PhotoId::new(),
            external_id: external_id.into(),
            owner_id: None,
            blob_url: None,
            title: String::new(),
            description: String::new(),
            author_name: String::new(),
            width: 0,
            height: 0,
            likes_count: 0,
            views_count: 0,
            downloads_count: 0,
            source_url: source_url.into(),
            uploaded_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Blob store key for this photo's binary.
    pub fn blob_key(&self) -> BlobKey {
        BlobKey::for_external_id(&self.external_id)
    }

    /// True once the binary has been uploaded.
    pub fn is_ingested(&self) -> bool {
        self.blob_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Field-wise equality ignoring store bookkeeping timestamps.
    pub fn same_content(&self, other: &Photo) -> bool {
        self.id == other.id
            && self.external_id == other.external_id
            && self.owner_id == other.owner_id
            && self.blob_url == other.blob_url
            && self.title == other.title
            && self.description == other.description
            && self.author_name == other.author_name
            && self.width == other.width
            && self.height == other.height
            && self.likes_count == other.likes_count
            && self.views_count == other.views_count
            && self.downloads_count == other.downloads_count
            && self.source_url == other.source_url
            && self.uploaded_at == other.uploaded_at
    }
}

/// Postgres keeps microseconds; truncate so values survive a round trip.
pub fn store_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}
