//! Coordinator: bucket and file operations over two stores that share no
//! transaction.
//!
//! Ordering rules that keep the stores consistent:
//! - bucket creation inserts the row, creates the container, and only then
//!   commits the row;
//! - upload writes the blob first and the row last (an orphaned blob is
//!   harmless, a row without a blob is not);
//! - delete fences the row (soft delete) before removing the blob, and drops
//!   the row last.
//!
//! Suffix allocation for same-named files is serialized per filename by the
//! metadata store's row lock, see [`MetadataStore::lock_and_compute_next_suffix`].

use super::naming::{check_bucket_name, check_filename, display_name};
use crate::{
    models::{
        bucket::{Bucket, BucketAvailability, NewBucket},
        file::{FileAccess, FileEntry, FileRecord},
    },
    storage::{BlobError, BlobStore, ByteStream, MetadataError, MetadataResult, MetadataStore},
};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_MIME: &str = "application/octet-stream";

/// Failure of either leaf store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store: {0}")]
    Metadata(#[from] MetadataError),
    #[error("blob store: {0}")]
    Blob(#[from] BlobError),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("file `{0}` not found")]
    FileNotFound(Uuid),
    #[error("the user has no permissions")]
    PermissionDenied,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("bucket `{0}` already exists")]
    Conflict(String),
    /// The caller's deadline passed before the operation finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{op}: {source}")]
    StoreUnavailable {
        op: &'static str,
        #[source]
        source: StoreError,
    },
    /// The blob was written but its row was not; the blob is left for cleanup.
    #[error(
        "file `{file_id}` written to container `{bucket_id}` but its metadata was not recorded: {source}"
    )]
    PartialBlobOrphan {
        bucket_id: i64,
        file_id: Uuid,
        #[source]
        source: MetadataError,
    },
}

impl CoordinatorError {
    fn store(op: &'static str, err: impl Into<StoreError>) -> Self {
        CoordinatorError::StoreUnavailable {
            op,
            source: err.into(),
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Clone, Debug)]
pub struct CreateBucketRequest {
    pub name: String,
    pub availability: BucketAvailability,
    pub owner: Uuid,
}

/// Absent fields are left unchanged.
#[derive(Clone, Debug)]
pub struct EditBucketRequest {
    pub bucket_name: String,
    pub requester: Uuid,
    pub availability: Option<BucketAvailability>,
    pub size_quota: Option<f64>,
}

/// One named byte stream submitted for upload.
pub struct UploadItem<'a> {
    pub filename: String,
    pub mime: String,
    pub access: FileAccess,
    pub body: ByteStream<'a>,
}

/// Yields upload items one at a time, each borrowing the source until it is
/// consumed. A multipart body is the typical source.
#[async_trait]
pub trait UploadSource: Send {
    async fn next_item(&mut self) -> CoordinatorResult<Option<UploadItem<'_>>>;
}

#[async_trait]
impl<'a> UploadSource for std::vec::IntoIter<UploadItem<'a>> {
    async fn next_item(&mut self) -> CoordinatorResult<Option<UploadItem<'_>>> {
        Ok(self.next())
    }
}

/// Result of one item of a multi-file upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub filename: String,
    pub result: CoordinatorResult<Uuid>,
}

/// Absent or empty fields are left unchanged.
#[derive(Clone, Debug)]
pub struct EditFileRequest {
    pub bucket_name: String,
    pub file_id: Uuid,
    pub requester: Uuid,
    pub filename: Option<String>,
    pub access: Option<FileAccess>,
}

/// A file cleared for serving, with its blob opened.
pub struct FileDownload<R> {
    pub file: FileRecord,
    pub display_name: String,
    pub reader: R,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: usize,
    pub failed: usize,
}

/// Access decision for fetching a file.
///
/// The file must belong to the bucket, and either the bucket is accessible
/// and the file public, or the requester owns the bucket.
pub fn may_serve(bucket: &Bucket, file: &FileRecord, requester: Option<Uuid>) -> bool {
    if file.bucket_id != bucket.id {
        return false;
    }
    let public = bucket.availability == BucketAvailability::Accessible
        && file.access == FileAccess::Public;
    public || requester == Some(bucket.owner_id)
}

/// Listing view of a file, with its display name rendered.
pub fn file_entry(file: FileRecord) -> FileEntry {
    FileEntry {
        id: file.id,
        name: display_name(&file.filename, file.filename_suffix),
        filename: file.filename,
        mime: file.mime,
        access: file.access,
        size_bytes: file.size_bytes,
        created_at: file.created_at,
    }
}

pub struct Coordinator<M, B> {
    meta: M,
    blobs: B,
    default_size_quota: f64,
}

impl<M: MetadataStore, B: BlobStore> Coordinator<M, B> {
    pub fn new(meta: M, blobs: B) -> Self {
        Self {
            meta,
            blobs,
            default_size_quota: 0.0,
        }
    }

    /// Quota recorded on newly created buckets.
    pub fn with_default_size_quota(mut self, quota: f64) -> Self {
        self.default_size_quota = quota;
        self
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    async fn begin(&self, op: &'static str) -> CoordinatorResult<M::Tx> {
        self.meta
            .begin()
            .await
            .map_err(|err| CoordinatorError::store(op, err))
    }

    /// Transaction for operations that read and then write.
    async fn begin_write(&self, op: &'static str) -> CoordinatorResult<M::Tx> {
        self.meta
            .begin_write()
            .await
            .map_err(|err| CoordinatorError::store(op, err))
    }

    /// Commit on success, roll back on failure. Every transaction ends here.
    async fn finish<T>(
        &self,
        op: &'static str,
        tx: M::Tx,
        result: CoordinatorResult<T>,
    ) -> CoordinatorResult<T> {
        match result {
            Ok(value) => {
                self.meta
                    .commit(tx)
                    .await
                    .map_err(|err| CoordinatorError::store(op, err))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.meta.rollback(tx).await {
                    warn!("{}: rollback failed: {}", op, rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn resolve_bucket(
        &self,
        op: &'static str,
        tx: &mut M::Tx,
        name: &str,
    ) -> CoordinatorResult<Bucket> {
        match self.meta.get_bucket_by_name(tx, name).await {
            Ok(bucket) => Ok(bucket),
            Err(MetadataError::NoRows) => Err(CoordinatorError::BucketNotFound(name.to_string())),
            Err(err) => Err(CoordinatorError::store(op, err)),
        }
    }

    async fn resolve_file(
        &self,
        op: &'static str,
        tx: &mut M::Tx,
        file_id: Uuid,
    ) -> CoordinatorResult<FileRecord> {
        match self.meta.get_file_by_id(tx, file_id).await {
            Ok(file) => Ok(file),
            Err(MetadataError::NoRows) => Err(CoordinatorError::FileNotFound(file_id)),
            Err(err) => Err(CoordinatorError::store(op, err)),
        }
    }

    /// Resolve a bucket the requester must own.
    async fn owned_bucket(
        &self,
        op: &'static str,
        tx: &mut M::Tx,
        name: &str,
        requester: Uuid,
    ) -> CoordinatorResult<Bucket> {
        let bucket = self.resolve_bucket(op, tx, name).await?;
        if bucket.owner_id != requester {
            debug!("{}: {} does not own bucket {}", op, requester, name);
            return Err(CoordinatorError::PermissionDenied);
        }
        Ok(bucket)
    }

    /// Resolve a file that must live in `bucket`.
    async fn file_in_bucket(
        &self,
        op: &'static str,
        tx: &mut M::Tx,
        bucket: &Bucket,
        file_id: Uuid,
    ) -> CoordinatorResult<FileRecord> {
        let file = self.resolve_file(op, tx, file_id).await?;
        if file.bucket_id != bucket.id {
            return Err(CoordinatorError::BadRequest(format!(
                "file `{}` is not in bucket `{}`",
                file_id, bucket.name
            )));
        }
        Ok(file)
    }

    async fn load_bucket(&self, op: &'static str, name: &str) -> CoordinatorResult<Bucket> {
        let mut tx = self.begin(op).await?;
        let result = self.resolve_bucket(op, &mut tx, name).await;
        self.finish(op, tx, result).await
    }

    /// Insert the bucket row and create its container in one metadata
    /// transaction. The row commits only after the container exists.
    pub async fn create_bucket(&self, request: CreateBucketRequest) -> CoordinatorResult<Bucket> {
        const OP: &str = "create_bucket";
        check_bucket_name(&request.name).map_err(|reason| {
            CoordinatorError::BadRequest(format!("bucket `{}` invalid: {}", request.name, reason))
        })?;

        let new_bucket = NewBucket {
            name: request.name,
            owner_id: request.owner,
            availability: request.availability,
            size_quota: self.default_size_quota,
            created_at: Utc::now(),
        };

        let mut tx = self.begin_write(OP).await?;
        let result = async {
            let bucket = match self.meta.insert_bucket(&mut tx, &new_bucket).await {
                Ok(bucket) => bucket,
                Err(MetadataError::UniqueViolation) => {
                    return Err(CoordinatorError::Conflict(new_bucket.name.clone()));
                }
                Err(err) => return Err(CoordinatorError::store(OP, err)),
            };
            self.blobs
                .create_container(bucket.id)
                .await
                .map_err(|err| CoordinatorError::store(OP, err))?;
            Ok::<_, CoordinatorError>(bucket)
        }
        .await;
        let bucket = self.finish(OP, tx, result).await?;

        info!(
            "created bucket {} (id {}) for {}",
            bucket.name, bucket.id, bucket.owner_id
        );
        Ok(bucket)
    }

    /// Owner-only update of availability and quota. Last writer wins.
    pub async fn edit_bucket(&self, request: EditBucketRequest) -> CoordinatorResult<Bucket> {
        const OP: &str = "edit_bucket";
        if let Some(quota) = request.size_quota {
            if !quota.is_finite() || quota < 0.0 {
                return Err(CoordinatorError::BadRequest(format!(
                    "size quota {} must be a non-negative number",
                    quota
                )));
            }
        }

        let mut tx = self.begin_write(OP).await?;
        let result = async {
            let mut bucket = self
                .owned_bucket(OP, &mut tx, &request.bucket_name, request.requester)
                .await?;
            if let Some(availability) = request.availability {
                bucket.availability = availability;
            }
            if let Some(quota) = request.size_quota {
                bucket.size_quota = quota;
            }
            self.meta
                .update_bucket(&mut tx, &bucket)
                .await
                .map_err(|err| CoordinatorError::store(OP, err))?;
            Ok::<_, CoordinatorError>(bucket)
        }
        .await;
        self.finish(OP, tx, result).await
    }

    /// Upload one file and return its new id.
    ///
    /// The blob is written under a freshly generated id before any row
    /// exists. If recording the row then fails the blob stays behind and the
    /// call fails with [`CoordinatorError::PartialBlobOrphan`].
    pub async fn upload_file(
        &self,
        bucket_name: &str,
        uploader: Uuid,
        item: UploadItem<'_>,
    ) -> CoordinatorResult<Uuid> {
        const OP: &str = "upload_file";
        let UploadItem {
            filename,
            mime,
            access,
            body,
        } = item;
        check_filename(&filename)
            .map_err(|reason| CoordinatorError::BadRequest(reason.to_string()))?;

        let bucket = self.load_bucket(OP, bucket_name).await?;
        if bucket.owner_id != uploader {
            return Err(CoordinatorError::PermissionDenied);
        }

        let file_id = Uuid::new_v4();
        let receipt = self
            .blobs
            .write_object(bucket.id, file_id, body)
            .await
            .map_err(|err| match err {
                BlobError::Interrupted(source) => {
                    CoordinatorError::BadRequest(format!("upload body interrupted: {}", source))
                }
                other => CoordinatorError::store(OP, other),
            })?;

        let record = FileRecord {
            id: file_id,
            bucket_id: bucket.id,
            filename,
            mime: if mime.trim().is_empty() {
                DEFAULT_MIME.to_string()
            } else {
                mime
            },
            access,
            size_bytes: i64::try_from(receipt.bytes_written).unwrap_or(i64::MAX),
            etag: Some(receipt.etag),
            filename_suffix: 0,
            is_deleted: false,
            created_at: Utc::now(),
        };

        match self.record_upload(record).await {
            Ok(record) => {
                info!(
                    "stored {} as {} (suffix {}, {} bytes) in bucket {}",
                    record.filename,
                    record.id,
                    record.filename_suffix,
                    record.size_bytes,
                    bucket.name
                );
                Ok(record.id)
            }
            Err(source) => {
                error!(
                    bucket_id = bucket.id,
                    file_id = %file_id,
                    "orphaned blob left behind, metadata insert failed: {}",
                    source
                );
                Err(CoordinatorError::PartialBlobOrphan {
                    bucket_id: bucket.id,
                    file_id,
                    source,
                })
            }
        }
    }

    /// Allocate the display suffix and insert the row, holding the filename
    /// lock until commit.
    async fn record_upload(&self, mut record: FileRecord) -> MetadataResult<FileRecord> {
        let mut tx = self.meta.begin_write().await?;
        let inserted = async {
            record.filename_suffix = self
                .meta
                .lock_and_compute_next_suffix(&mut tx, record.bucket_id, &record.filename)
                .await?;
            self.meta.insert_file_with_id(&mut tx, &record).await
        }
        .await;

        match inserted {
            Ok(()) => {
                self.meta.commit(tx).await?;
                Ok(record)
            }
            Err(err) => {
                if let Err(rollback_err) = self.meta.rollback(tx).await {
                    warn!("upload_file: rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Upload every item `source` yields. Each item succeeds or fails on its
    /// own; a source that breaks ends the batch with one failed outcome.
    ///
    /// Reading the source and every upload run against `deadline`. Once it
    /// passes, the item in flight is abandoned and reported as
    /// [`CoordinatorError::DeadlineExceeded`], and the batch ends; outcomes of
    /// earlier items are kept.
    pub async fn upload_files<S: UploadSource>(
        &self,
        bucket_name: &str,
        uploader: Uuid,
        source: &mut S,
        deadline: Instant,
    ) -> Vec<UploadOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let item = match timeout_at(deadline, source.next_item()).await {
                Ok(Ok(Some(item))) => item,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    warn!("upload into {} stopped: {}", bucket_name, err);
                    outcomes.push(UploadOutcome {
                        filename: String::new(),
                        result: Err(err),
                    });
                    break;
                }
                Err(_) => {
                    warn!("upload into {} ran out of time between items", bucket_name);
                    outcomes.push(UploadOutcome {
                        filename: String::new(),
                        result: Err(CoordinatorError::DeadlineExceeded),
                    });
                    break;
                }
            };
            let filename = item.filename.clone();
            let (result, expired) =
                match timeout_at(deadline, self.upload_file(bucket_name, uploader, item)).await {
                    Ok(result) => (result, false),
                    Err(_) => (Err(CoordinatorError::DeadlineExceeded), true),
                };
            if let Err(err) = &result {
                warn!("upload of {} into {} failed: {}", filename, bucket_name, err);
            }
            outcomes.push(UploadOutcome { filename, result });
            if expired {
                break;
            }
        }
        outcomes
    }

    /// Decide whether `requester` (None for anonymous) may read the file and
    /// open its blob if so.
    pub async fn fetch_file(
        &self,
        bucket_name: &str,
        file_id: Uuid,
        requester: Option<Uuid>,
    ) -> CoordinatorResult<FileDownload<B::Reader>> {
        const OP: &str = "fetch_file";
        let mut tx = self.begin(OP).await?;
        let lookup = async {
            let bucket = self.resolve_bucket(OP, &mut tx, bucket_name).await?;
            let file = self.resolve_file(OP, &mut tx, file_id).await?;
            Ok::<_, CoordinatorError>((bucket, file))
        }
        .await;
        let (bucket, file) = self.finish(OP, tx, lookup).await?;

        if !may_serve(&bucket, &file, requester) {
            debug!(
                "fetch of {} from {} refused for {:?}",
                file_id, bucket_name, requester
            );
            return Err(CoordinatorError::PermissionDenied);
        }

        let reader = self
            .blobs
            .open_object(bucket.id, file.id)
            .await
            .map_err(|err| {
                if let BlobError::NotFound { .. } = err {
                    error!(
                        bucket_id = bucket.id,
                        file_id = %file.id,
                        "live file row has no blob"
                    );
                }
                CoordinatorError::store(OP, err)
            })?;

        Ok(FileDownload {
            display_name: display_name(&file.filename, file.filename_suffix),
            file,
            reader,
        })
    }

    /// Owner-only listing of live files, ordered by filename then suffix,
    /// with display names rendered.
    pub async fn list_files(
        &self,
        bucket_name: &str,
        requester: Uuid,
    ) -> CoordinatorResult<Vec<FileEntry>> {
        const OP: &str = "list_files";
        let mut tx = self.begin(OP).await?;
        let result = async {
            let bucket = self
                .owned_bucket(OP, &mut tx, bucket_name, requester)
                .await?;
            self.meta
                .list_files_of_bucket(&mut tx, bucket.id)
                .await
                .map_err(|err| CoordinatorError::store(OP, err))
        }
        .await;
        let files = self.finish(OP, tx, result).await?;
        Ok(files.into_iter().map(file_entry).collect())
    }

    /// Owner-only rename and/or access change.
    ///
    /// A rename takes the filename lock of the new name and moves the file to
    /// the next free suffix there.
    pub async fn edit_file(&self, request: EditFileRequest) -> CoordinatorResult<FileRecord> {
        const OP: &str = "edit_file";
        let new_name = request.filename.filter(|name| !name.is_empty());

        let mut tx = self.begin_write(OP).await?;
        let result = async {
            let bucket = self
                .owned_bucket(OP, &mut tx, &request.bucket_name, request.requester)
                .await?;
            let mut file = self
                .file_in_bucket(OP, &mut tx, &bucket, request.file_id)
                .await?;

            if let Some(name) = new_name {
                check_filename(&name)
                    .map_err(|reason| CoordinatorError::BadRequest(reason.to_string()))?;
                if name != file.filename {
                    file.filename_suffix = self
                        .meta
                        .lock_and_compute_next_suffix(&mut tx, bucket.id, &name)
                        .await
                        .map_err(|err| CoordinatorError::store(OP, err))?;
                    file.filename = name;
                }
            }
            if let Some(access) = request.access {
                file.access = access;
            }

            match self.meta.update_file(&mut tx, &file).await {
                Ok(()) => Ok(file),
                Err(MetadataError::NoRows) => Err(CoordinatorError::FileNotFound(file.id)),
                Err(err) => Err(CoordinatorError::store(OP, err)),
            }
        }
        .await;
        self.finish(OP, tx, result).await
    }

    /// Two-phase delete: fence the row, remove the blob, drop the row.
    ///
    /// If the blob cannot be removed the row stays soft-deleted (invisible to
    /// reads) until [`Coordinator::purge_deleted`] reclaims it.
    pub async fn delete_file(
        &self,
        bucket_name: &str,
        file_id: Uuid,
        requester: Uuid,
    ) -> CoordinatorResult<()> {
        const OP: &str = "delete_file";
        let mut tx = self.begin_write(OP).await?;
        let fenced = async {
            let bucket = self
                .owned_bucket(OP, &mut tx, bucket_name, requester)
                .await?;
            let file = self.file_in_bucket(OP, &mut tx, &bucket, file_id).await?;
            match self.meta.mark_file_deleted(&mut tx, file.id).await {
                Ok(()) => Ok(file),
                Err(MetadataError::NoRows) => Err(CoordinatorError::FileNotFound(file_id)),
                Err(err) => Err(CoordinatorError::store(OP, err)),
            }
        }
        .await;
        let file = self.finish(OP, tx, fenced).await?;
        debug!("file {} fenced for deletion", file.id);

        self.remove_blob(OP, &file).await?;
        self.remove_row(OP, file.id).await?;

        info!("deleted file {} from bucket {}", file.id, bucket_name);
        Ok(())
    }

    async fn remove_blob(&self, op: &'static str, file: &FileRecord) -> CoordinatorResult<()> {
        match self.blobs.delete_object(file.bucket_id, file.id).await {
            Ok(()) => Ok(()),
            Err(BlobError::NotFound { .. }) => {
                warn!(
                    "blob of file {} already missing from container {}",
                    file.id, file.bucket_id
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    bucket_id = file.bucket_id,
                    file_id = %file.id,
                    "blob delete failed, file stays soft-deleted until purged: {}",
                    err
                );
                Err(CoordinatorError::store(op, err))
            }
        }
    }

    async fn remove_row(&self, op: &'static str, file_id: Uuid) -> CoordinatorResult<()> {
        let mut tx = self.begin_write(op).await?;
        let result = match self.meta.delete_file_row(&mut tx, file_id).await {
            // Already reclaimed by a concurrent purge.
            Ok(()) | Err(MetadataError::NoRows) => Ok(()),
            Err(err) => Err(CoordinatorError::store(op, err)),
        };
        self.finish(op, tx, result).await
    }

    /// Finish deletes that stopped after the fencing step.
    pub async fn purge_deleted(&self) -> CoordinatorResult<PurgeReport> {
        const OP: &str = "purge_deleted";
        let mut tx = self.begin(OP).await?;
        let result = self
            .meta
            .list_deleted_files(&mut tx)
            .await
            .map_err(|err| CoordinatorError::store(OP, err));
        let stuck = self.finish(OP, tx, result).await?;

        let mut report = PurgeReport::default();
        for file in stuck {
            let outcome = match self.remove_blob(OP, &file).await {
                Ok(()) => self.remove_row(OP, file.id).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => report.purged += 1,
                Err(err) => {
                    warn!("could not purge file {}: {}", file.id, err);
                    report.failed += 1;
                }
            }
        }

        info!(
            "purge finished: {} purged, {} failed",
            report.purged, report.failed
        );
        Ok(report)
    }
}
