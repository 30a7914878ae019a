//! Represents a file stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-file visibility.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileAccess {
    #[default]
    Private,
    Public,
}

/// Metadata row for a single file.
///
/// The bytes live in the blob store under `(bucket_id, id)`. Ownership is the
/// ownership of the bucket; files carry no owner of their own.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Globally unique id, allocated before the row exists so the blob can be
    /// named first.
    pub id: Uuid,

    pub bucket_id: i64,

    /// Literal filename as uploaded. Not unique within a bucket.
    pub filename: String,

    pub mime: String,

    pub access: FileAccess,

    pub size_bytes: i64,

    /// MD5 of the content, hex encoded.
    pub etag: Option<String>,

    /// Display disambiguator among files sharing `filename`. Zero is never
    /// rendered.
    pub filename_suffix: i64,

    /// Fencing flag set before the blob is removed.
    pub is_deleted: bool,

    pub created_at: DateTime<Utc>,
}

/// A file as shown in a bucket listing.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: Uuid,
    /// Rendered display name, suffixed when needed.
    pub name: String,
    /// Stored literal filename.
    pub filename: String,
    pub mime: String,
    pub access: FileAccess,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}
