//! SQLite-backed [`MetadataStore`].
//!
//! Buckets and files live in two tables (see `migrations/0001_init.sql`).
//! Write transactions open with `BEGIN IMMEDIATE`, taking SQLite's write lock
//! up front. A deferred transaction that reads first and writes later fails
//! with `SQLITE_BUSY` (no busy wait) once another writer has committed in
//! between; an immediate one waits out the busy timeout instead.
//!
//! SQLite has no `SELECT ... FOR UPDATE`. Since write transactions already
//! hold the database write lock, the filename lock reduces to a no-op
//! `UPDATE` over the matching rows, which keeps the statement meaningful on
//! stores that lock per row.

use super::{MetadataError, MetadataResult, MetadataStore};
use crate::models::{
    bucket::{Bucket, NewBucket},
    file::FileRecord,
};
use async_trait::async_trait;
use sqlx::{
    Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str = "id, bucket_id, filename, mime, access, size_bytes, etag, \
                            filename_suffix, is_deleted, created_at";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Open a pool for `database_url`, creating the database file if needed.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = INIT_MIGRATION
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn classify(err: sqlx::Error) -> MetadataError {
    match err {
        sqlx::Error::RowNotFound => MetadataError::NoRows,
        err if is_unique_violation(&err) => MetadataError::UniqueViolation,
        other => MetadataError::Sqlx(other),
    }
}

fn expect_rows(rows_affected: u64) -> MetadataResult<()> {
    if rows_affected == 0 {
        Err(MetadataError::NoRows)
    } else {
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    type Tx = Transaction<'static, Sqlite>;

    async fn begin(&self) -> MetadataResult<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn begin_write(&self) -> MetadataResult<Self::Tx> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn commit(&self, tx: Self::Tx) -> MetadataResult<()> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> MetadataResult<()> {
        Ok(tx.rollback().await?)
    }

    async fn insert_bucket(
        &self,
        tx: &mut Self::Tx,
        bucket: &NewBucket,
    ) -> MetadataResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "INSERT INTO buckets (name, owner_id, availability, size_quota, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id, name, owner_id, availability, size_quota, created_at",
        )
        .bind(&bucket.name)
        .bind(bucket.owner_id)
        .bind(bucket.availability)
        .bind(bucket.size_quota)
        .bind(bucket.created_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)
    }

    async fn get_bucket_by_name(&self, tx: &mut Self::Tx, name: &str) -> MetadataResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, owner_id, availability, size_quota, created_at
             FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)
    }

    async fn update_bucket(&self, tx: &mut Self::Tx, bucket: &Bucket) -> MetadataResult<()> {
        let result =
            sqlx::query("UPDATE buckets SET availability = ?, size_quota = ? WHERE id = ?")
                .bind(bucket.availability)
                .bind(bucket.size_quota)
                .bind(bucket.id)
                .execute(&mut **tx)
                .await
                .map_err(classify)?;
        expect_rows(result.rows_affected())
    }

    async fn insert_file_with_id(
        &self,
        tx: &mut Self::Tx,
        file: &FileRecord,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO files (
                id, bucket_id, filename, mime, access, size_bytes, etag,
                filename_suffix, is_deleted, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(file.id)
        .bind(file.bucket_id)
        .bind(&file.filename)
        .bind(&file.mime)
        .bind(file.access)
        .bind(file.size_bytes)
        .bind(&file.etag)
        .bind(file.filename_suffix)
        .bind(file.created_at)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn get_file_by_id(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ? AND is_deleted = 0"
        ))
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)
    }

    async fn list_files_of_bucket(
        &self,
        tx: &mut Self::Tx,
        bucket_id: i64,
    ) -> MetadataResult<Vec<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE bucket_id = ? AND is_deleted = 0
             ORDER BY filename ASC, filename_suffix ASC"
        ))
        .bind(bucket_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(classify)
    }

    async fn update_file(&self, tx: &mut Self::Tx, file: &FileRecord) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE files SET filename = ?, access = ?, filename_suffix = ?
             WHERE id = ? AND is_deleted = 0",
        )
        .bind(&file.filename)
        .bind(file.access)
        .bind(file.filename_suffix)
        .bind(file.id)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;
        expect_rows(result.rows_affected())
    }

    async fn mark_file_deleted(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE files SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        expect_rows(result.rows_affected())
    }

    async fn delete_file_row(&self, tx: &mut Self::Tx, id: Uuid) -> MetadataResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(classify)?;
        expect_rows(result.rows_affected())
    }

    async fn lock_and_compute_next_suffix(
        &self,
        tx: &mut Self::Tx,
        bucket_id: i64,
        filename: &str,
    ) -> MetadataResult<i64> {
        sqlx::query(
            "UPDATE files SET filename_suffix = filename_suffix
             WHERE bucket_id = ? AND filename = ? AND is_deleted = 0",
        )
        .bind(bucket_id)
        .bind(filename)
        .execute(&mut **tx)
        .await
        .map_err(classify)?;

        // Soft-deleted rows count too, so a suffix in limbo is not handed out again.
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(filename_suffix), -1) + 1
             FROM files WHERE bucket_id = ? AND filename = ?",
        )
        .bind(bucket_id)
        .bind(filename)
        .fetch_one(&mut **tx)
        .await
        .map_err(classify)
    }

    async fn list_deleted_files(&self, tx: &mut Self::Tx) -> MetadataResult<Vec<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE is_deleted = 1 ORDER BY created_at ASC"
        ))
        .fetch_all(&mut **tx)
        .await
        .map_err(classify)
    }
}
