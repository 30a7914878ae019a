//! Local-disk [`BlobStore`].
//!
//! Layout: `base_path/{bucket_id}/{file_uuid}`. Each bucket id gets its own
//! directory (the container). Writes stream into a temporary file inside the
//! container and are renamed into place once flushed and synced.

use super::{BlobError, BlobReceipt, BlobResult, BlobStore, ByteStream};
use async_trait::async_trait;
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct DiskBlobStore {
    base_path: PathBuf,
}

impl DiskBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn container_path(&self, container: i64) -> PathBuf {
        self.base_path.join(container.to_string())
    }

    fn object_path(&self, container: i64, object: Uuid) -> PathBuf {
        self.container_path(container)
            .join(object.as_hyphenated().to_string())
    }

    fn not_found(container: i64, object: Uuid) -> impl FnOnce(io::Error) -> BlobError {
        move |err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound { container, object }
            } else {
                BlobError::Io(err)
            }
        }
    }
}

/// Remove a partially written temp file, ignoring failures.
async fn discard(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path).await {
        debug!("could not remove temp file {}: {}", tmp_path.display(), err);
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    type Reader = File;

    /// Idempotent: a leftover directory from an aborted bucket creation is
    /// reused.
    async fn create_container(&self, container: i64) -> BlobResult<()> {
        fs::create_dir_all(self.container_path(container)).await?;
        Ok(())
    }

    async fn write_object(
        &self,
        container: i64,
        object: Uuid,
        mut body: ByteStream<'_>,
    ) -> BlobResult<BlobReceipt> {
        let final_path = self.object_path(container, object);
        let tmp_path = self
            .container_path(container)
            .join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut bytes_written: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    discard(&tmp_path).await;
                    return Err(BlobError::Interrupted(err));
                }
            };
            bytes_written += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                discard(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            discard(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            discard(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            discard(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        debug!(
            "stored object {} ({} bytes) in container {}",
            object, bytes_written, container
        );
        Ok(BlobReceipt {
            bytes_written,
            etag: format!("{:x}", digest.compute()),
        })
    }

    async fn open_object(&self, container: i64, object: Uuid) -> BlobResult<Self::Reader> {
        File::open(self.object_path(container, object))
            .await
            .map_err(Self::not_found(container, object))
    }

    async fn delete_object(&self, container: i64, object: Uuid) -> BlobResult<()> {
        fs::remove_file(self.object_path(container, object))
            .await
            .map_err(Self::not_found(container, object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn chunks(parts: &[&'static [u8]]) -> ByteStream<'static> {
        let items: Vec<io::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn write_read_and_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        store.create_container(7).await.unwrap();

        let object = Uuid::new_v4();
        let receipt = store
            .write_object(7, object, chunks(&[b"hello ", b"world"]))
            .await
            .unwrap();
        assert_eq!(receipt.bytes_written, 11);
        assert_eq!(receipt.etag, format!("{:x}", md5::compute(b"hello world")));

        let mut reader = store.open_object(7, object).await.unwrap();
        reader.seek(io::SeekFrom::Start(6)).await.unwrap();
        let mut tail = String::new();
        reader.read_to_string(&mut tail).await.unwrap();
        assert_eq!(tail, "world");

        store.delete_object(7, object).await.unwrap();
        assert!(matches!(
            store.open_object(7, object).await,
            Err(BlobError::NotFound { container: 7, .. })
        ));
        assert!(matches!(
            store.delete_object(7, object).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_container_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        store.create_container(1).await.unwrap();
        store.create_container(1).await.unwrap();
        assert!(dir.path().join("1").is_dir());
    }

    #[tokio::test]
    async fn interrupted_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        store.create_container(3).await.unwrap();

        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("client went away")),
        ])
        .boxed();
        let object = Uuid::new_v4();
        let result = store.write_object(3, object, body).await;
        assert!(matches!(result, Err(BlobError::Interrupted(_))));

        let mut entries = std::fs::read_dir(dir.path().join("3")).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn writing_into_missing_container_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        let result = store
            .write_object(99, Uuid::new_v4(), chunks(&[b"data"]))
            .await;
        assert!(matches!(result, Err(BlobError::Io(_))));
    }
}
