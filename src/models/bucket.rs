//! Represents a bucket: a named, owned collection of files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Whether public files in a bucket may be served to anonymous callers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BucketAvailability {
    Accessible,
    Closed,
}

/// A bucket row as stored in the metadata store.
///
/// The bucket id doubles as the blob container key, so it is assigned by the
/// metadata store before the container exists.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Store-assigned identifier.
    pub id: i64,

    /// Unique bucket name (6-30 chars, alphanumeric or hyphen).
    pub name: String,

    /// Opaque id of the owning user.
    pub owner_id: Uuid,

    pub availability: BucketAvailability,

    /// Informational size quota, never enforced.
    pub size_quota: f64,

    pub created_at: DateTime<Utc>,
}

/// Values for a bucket row that has not been inserted yet.
#[derive(Clone, Debug)]
pub struct NewBucket {
    pub name: String,
    pub owner_id: Uuid,
    pub availability: BucketAvailability,
    pub size_quota: f64,
    pub created_at: DateTime<Utc>,
}
