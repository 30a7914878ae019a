//! Leaf stores consumed by the coordinator.
//!
//! - [`MetadataStore`]: transactional rows for buckets and files.
//! - [`BlobStore`]: byte streams keyed by `(container, object)`.
//!
//! Neither store knows about the other; keeping them consistent is the
//! coordinator's job.

pub mod disk;
#[cfg(test)]
pub mod memory;
pub mod sqlite;

use crate::models::{
    bucket::{Bucket, NewBucket},
    file::FileRecord,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};
use uuid::Uuid;

/// Incoming file content.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("no rows")]
    NoRows,
    #[error("unique constraint violated")]
    UniqueViolation,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object `{object}` not found in container `{container}`")]
    NotFound { container: i64, object: Uuid },
    /// The caller's byte stream failed mid-copy.
    #[error("source stream interrupted: {0}")]
    Interrupted(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// What a completed blob write produced.
#[derive(Clone, Debug)]
pub struct BlobReceipt {
    pub bytes_written: u64,
    /// Hex MD5 of the written bytes.
    pub etag: String,
}

/// Relational metadata for buckets and files.
///
/// Every operation runs against an explicit transaction obtained from
/// [`MetadataStore::begin`] (reads) or [`MetadataStore::begin_write`] (any
/// transaction that may write). Dropping a transaction without committing
/// rolls it back. Point lookups return [`MetadataError::NoRows`] when nothing
/// matches.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    type Tx: Send;

    async fn begin(&self) -> MetadataResult<Self::Tx>;

    /// Begin a transaction that will write. It holds the store's write
    /// access from its first statement, so reads made before the first write
    /// cannot be invalidated by another writer committing in between.
    async fn begin_write(&self) -> MetadataResult<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> MetadataResult<()>;

    async fn rollback(&self, tx: Self::Tx) -> MetadataResult<()>;

    /// Insert a bucket and return it with its assigned id.
    async fn insert_bucket(&self, tx: &mut Self::Tx, bucket: &NewBucket)
    -> MetadataResult<Bucket>;

    async fn get_bucket_by_name(&self, tx: &mut Self::Tx, name: &str) -> MetadataResult<Bucket>;

    /// Overwrite availability and quota of the bucket with `bucket.id`.
    async fn update_bucket(&self, tx: &mut Self::Tx, bucket: &Bucket) -> MetadataResult<()>;

    /// Insert a file row under its pre-allocated id.
    async fn insert_file_with_id(&self, tx: &mut Self::Tx, file: &FileRecord)
    -> MetadataResult<()>;

    /// Fetch a file that is not soft-deleted.
    async fn get_file_by_id(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<FileRecord>;

    /// Non-deleted files of a bucket ordered by `(filename, filename_suffix)`.
    async fn list_files_of_bucket(
        &self,
        tx: &mut Self::Tx,
        bucket_id: i64,
    ) -> MetadataResult<Vec<FileRecord>>;

    /// Blind overwrite of filename, access and suffix of a live file.
    async fn update_file(&self, tx: &mut Self::Tx, file: &FileRecord) -> MetadataResult<()>;

    /// Set the soft-delete flag. Fails with `NoRows` if already deleted.
    async fn mark_file_deleted(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<()>;

    async fn delete_file_row(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<()>;

    /// Lock the live rows sharing `filename` in the bucket for the rest of
    /// the transaction and return `max(suffix) + 1`, or 0 when there are
    /// none. Requires a transaction from [`MetadataStore::begin_write`].
    async fn lock_and_compute_next_suffix(
        &self,
        tx: &mut Self::Tx,
        bucket_id: i64,
        filename: &str,
    ) -> MetadataResult<i64>;

    /// Rows left soft-deleted by an unfinished delete.
    async fn list_deleted_files(&self, tx: &mut Self::Tx) -> MetadataResult<Vec<FileRecord>>;
}

/// Byte storage addressed by container and object id.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    type Reader: AsyncRead + AsyncSeek + Send + Unpin + 'static;

    async fn create_container(&self, container: i64) -> BlobResult<()>;

    async fn write_object(
        &self,
        container: i64,
        object: Uuid,
        body: ByteStream<'_>,
    ) -> BlobResult<BlobReceipt>;

    async fn open_object(&self, container: i64, object: Uuid) -> BlobResult<Self::Reader>;

    async fn delete_object(&self, container: i64, object: Uuid) -> BlobResult<()>;
}
