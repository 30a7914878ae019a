//! In-memory doubles of both stores for coordinator tests.
//!
//! A metadata transaction holds the whole state lock from `begin` until it is
//! committed or dropped, and works on a staged copy that only replaces the
//! live state on commit. That is stricter than row locking, but gives the
//! same visibility and rollback behavior the coordinator relies on.

use super::{
    BlobError, BlobReceipt, BlobResult, BlobStore, ByteStream, MetadataError, MetadataResult,
    MetadataStore,
};
use crate::models::{
    bucket::{Bucket, NewBucket},
    file::FileRecord,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    io::{self, Cursor},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, Semaphore};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct MemoryState {
    buckets: Vec<Bucket>,
    next_bucket_id: i64,
    files: HashMap<Uuid, FileRecord>,
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    state: Arc<Mutex<MemoryState>>,
    fail_file_inserts: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `insert_file_with_id` fail as if the pool were exhausted.
    pub fn fail_file_inserts(&self, fail: bool) {
        self.fail_file_inserts.store(fail, Ordering::SeqCst);
    }

    /// Committed file rows, including soft-deleted ones.
    pub async fn all_files(&self) -> Vec<FileRecord> {
        self.state.lock().await.files.values().cloned().collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> MetadataResult<Self::Tx> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(MemoryTx { guard, staged })
    }

    async fn begin_write(&self) -> MetadataResult<Self::Tx> {
        self.begin().await
    }

    async fn commit(&self, tx: Self::Tx) -> MetadataResult<()> {
        let MemoryTx { mut guard, staged } = tx;
        *guard = staged;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> MetadataResult<()> {
        drop(tx);
        Ok(())
    }

    async fn insert_bucket(
        &self,
        tx: &mut Self::Tx,
        bucket: &NewBucket,
    ) -> MetadataResult<Bucket> {
        let state = &mut tx.staged;
        if state.buckets.iter().any(|b| b.name == bucket.name) {
            return Err(MetadataError::UniqueViolation);
        }
        state.next_bucket_id += 1;
        let row = Bucket {
            id: state.next_bucket_id,
            name: bucket.name.clone(),
            owner_id: bucket.owner_id,
            availability: bucket.availability,
            size_quota: bucket.size_quota,
            created_at: bucket.created_at,
        };
        state.buckets.push(row.clone());
        Ok(row)
    }

    async fn get_bucket_by_name(&self, tx: &mut Self::Tx, name: &str) -> MetadataResult<Bucket> {
        tx.staged
            .buckets
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .ok_or(MetadataError::NoRows)
    }

    async fn update_bucket(&self, tx: &mut Self::Tx, bucket: &Bucket) -> MetadataResult<()> {
        let row = tx
            .staged
            .buckets
            .iter_mut()
            .find(|b| b.id == bucket.id)
            .ok_or(MetadataError::NoRows)?;
        row.availability = bucket.availability;
        row.size_quota = bucket.size_quota;
        Ok(())
    }

    async fn insert_file_with_id(
        &self,
        tx: &mut Self::Tx,
        file: &FileRecord,
    ) -> MetadataResult<()> {
        if self.fail_file_inserts.load(Ordering::SeqCst) {
            return Err(MetadataError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        if tx.staged.files.contains_key(&file.id) {
            return Err(MetadataError::UniqueViolation);
        }
        let mut row = file.clone();
        row.is_deleted = false;
        tx.staged.files.insert(row.id, row);
        Ok(())
    }

    async fn get_file_by_id(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<FileRecord> {
        tx.staged
            .files
            .get(&id)
            .filter(|f| !f.is_deleted)
            .cloned()
            .ok_or(MetadataError::NoRows)
    }

    async fn list_files_of_bucket(
        &self,
        tx: &mut Self::Tx,
        bucket_id: i64,
    ) -> MetadataResult<Vec<FileRecord>> {
        let mut files: Vec<FileRecord> = tx
            .staged
            .files
            .values()
            .filter(|f| f.bucket_id == bucket_id && !f.is_deleted)
            .cloned()
            .collect();
        files.sort_by(|a, b| {
            a.filename
                .cmp(&b.filename)
                .then(a.filename_suffix.cmp(&b.filename_suffix))
        });
        Ok(files)
    }

    async fn update_file(&self, tx: &mut Self::Tx, file: &FileRecord) -> MetadataResult<()> {
        let row = tx
            .staged
            .files
            .get_mut(&file.id)
            .filter(|f| !f.is_deleted)
            .ok_or(MetadataError::NoRows)?;
        row.filename = file.filename.clone();
        row.access = file.access;
        row.filename_suffix = file.filename_suffix;
        Ok(())
    }

    async fn mark_file_deleted(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<()> {
        let row = tx
            .staged
            .files
            .get_mut(&id)
            .filter(|f| !f.is_deleted)
            .ok_or(MetadataError::NoRows)?;
        row.is_deleted = true;
        Ok(())
    }

    async fn delete_file_row(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<()> {
        tx.staged
            .files
            .remove(&id)
            .map(|_| ())
            .ok_or(MetadataError::NoRows)
    }

    async fn lock_and_compute_next_suffix(
        &self,
        tx: &mut Self::Tx,
        bucket_id: i64,
        filename: &str,
    ) -> MetadataResult<i64> {
        Ok(tx
            .staged
            .files
            .values()
            .filter(|f| f.bucket_id == bucket_id && f.filename == filename)
            .map(|f| f.filename_suffix)
            .max()
            .map_or(0, |max| max + 1))
    }

    async fn list_deleted_files(&self, tx: &mut Self::Tx) -> MetadataResult<Vec<FileRecord>> {
        Ok(tx
            .staged
            .files
            .values()
            .filter(|f| f.is_deleted)
            .cloned()
            .collect())
    }
}

pub struct MemoryBlobStore {
    containers: StdMutex<HashSet<i64>>,
    objects: StdMutex<HashMap<(i64, Uuid), Vec<u8>>>,
    fail_containers: AtomicBool,
    fail_deletes: AtomicBool,
    gate_deletes: AtomicBool,
    delete_entered: Notify,
    delete_release: Semaphore,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self {
            containers: StdMutex::default(),
            objects: StdMutex::default(),
            fail_containers: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            gate_deletes: AtomicBool::new(false),
            delete_entered: Notify::new(),
            delete_release: Semaphore::new(0),
        }
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_containers(&self, fail: bool) {
        self.fail_containers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Hold every `delete_object` until [`MemoryBlobStore::release_delete`].
    pub fn gate_deletes(&self, gate: bool) {
        self.gate_deletes.store(gate, Ordering::SeqCst);
    }

    /// Resolves once a gated delete is waiting.
    pub async fn delete_started(&self) {
        self.delete_entered.notified().await;
    }

    pub fn release_delete(&self) {
        self.delete_release.add_permits(1);
    }

    pub fn has_container(&self, container: i64) -> bool {
        self.containers.lock().unwrap().contains(&container)
    }

    pub fn object(&self, container: i64, object: Uuid) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(container, object))
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    type Reader = Cursor<Vec<u8>>;

    async fn create_container(&self, container: i64) -> BlobResult<()> {
        if self.fail_containers.load(Ordering::SeqCst) {
            return Err(BlobError::Io(io::Error::other("container creation refused")));
        }
        self.containers.lock().unwrap().insert(container);
        Ok(())
    }

    async fn write_object(
        &self,
        container: i64,
        object: Uuid,
        mut body: ByteStream<'_>,
    ) -> BlobResult<BlobReceipt> {
        if !self.has_container(container) {
            return Err(BlobError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no such container",
            )));
        }
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk.map_err(BlobError::Interrupted)?);
        }
        let receipt = BlobReceipt {
            bytes_written: data.len() as u64,
            etag: format!("{:x}", md5::compute(&data)),
        };
        self.objects.lock().unwrap().insert((container, object), data);
        Ok(receipt)
    }

    async fn open_object(&self, container: i64, object: Uuid) -> BlobResult<Self::Reader> {
        self.object(container, object)
            .map(Cursor::new)
            .ok_or(BlobError::NotFound { container, object })
    }

    async fn delete_object(&self, container: i64, object: Uuid) -> BlobResult<()> {
        if self.gate_deletes.load(Ordering::SeqCst) {
            self.delete_entered.notify_one();
            self.delete_release
                .acquire()
                .await
                .map_err(io::Error::other)?
                .forget();
        }
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Io(io::Error::other("disk unplugged")));
        }
        self.objects
            .lock()
            .unwrap()
            .remove(&(container, object))
            .map(|_| ())
            .ok_or(BlobError::NotFound { container, object })
    }
}
