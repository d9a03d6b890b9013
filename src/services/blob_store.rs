//! src/services/blob_store.rs
//!
//! BlobStore: named-stream upload/download plus rename/delete by id.
//! `DiskBlobStore` keeps payloads on local disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{id}` and writes one metadata record per
//! blob into the `{bucket}.files` collection of a `DocumentStore`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use md5::Context;
use serde_json::{Value, json};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{
        BlobMetadataRecord, Document, FindOptions, ObjectId,
        blob::{files_collection, newest_first},
        document::doc,
    },
    services::document_store::{DocumentStore, StoreError, StoreResult},
};

/// Chunked byte stream used for both upload and download.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `stream` under `filename`. Earlier blobs with the same name are
    /// kept as older revisions.
    async fn upload_from_stream(
        &self,
        bucket: &str,
        filename: &str,
        stream: ByteStream,
    ) -> StoreResult<ObjectId>;

    /// Open the newest revision of `filename`.
    async fn open_download_stream_by_name(
        &self,
        bucket: &str,
        filename: &str,
    ) -> StoreResult<ByteStream>;

    async fn rename(&self, bucket: &str, id: &ObjectId, new_filename: &str) -> StoreResult<()>;

    async fn delete(&self, bucket: &str, id: &ObjectId) -> StoreResult<()>;
}

#[derive(Clone)]
pub struct DiskBlobStore {
    /// Metadata records live here.
    store: Arc<dyn DocumentStore>,

    /// Base directory on disk where blob payloads are stored.
    base_path: PathBuf,
}

fn id_filter(id: &ObjectId) -> Document {
    doc(json!({ "_id": id.to_hex() }))
}

impl DiskBlobStore {
    pub fn new(store: Arc<dyn DocumentStore>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Bucket names become directory names, so keep them to a single plain segment.
    fn ensure_bucket_safe(bucket: &str) -> StoreResult<()> {
        if bucket.is_empty()
            || bucket.starts_with('.')
            || bucket
                .chars()
                .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
        {
            return Err(StoreError::InvalidName(bucket.to_string()));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directories from the md5 of `bucket/id`.
    fn blob_shards(bucket: &str, id: &ObjectId) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, bucket: &str, id: &ObjectId) -> PathBuf {
        let (shard_a, shard_b) = Self::blob_shards(bucket, id);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_hex());
        path
    }

    /// Stream into a temp file next to the final path, then rename into place.
    /// Returns `(length, md5)`.
    async fn write_payload(&self, path: &Path, mut stream: ByteStream) -> StoreResult<(i64, String)> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("blob path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut length: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            length += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        Ok((length, format!("{:x}", digest.compute())))
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn upload_from_stream(
        &self,
        bucket: &str,
        filename: &str,
        stream: ByteStream,
    ) -> StoreResult<ObjectId> {
        Self::ensure_bucket_safe(bucket)?;
        if filename.is_empty() {
            return Err(StoreError::InvalidName(filename.to_string()));
        }

        let id = ObjectId::new();
        let path = self.blob_path(bucket, &id);
        let (length, md5) = self.write_payload(&path, stream).await?;

        let record = BlobMetadataRecord {
            id,
            filename: filename.to_string(),
            length,
            md5: Some(md5),
            upload_date: Utc::now(),
            extra: Document::new(),
        };
        if let Err(err) = self
            .store
            .insert_one(&files_collection(bucket), record.to_document())
            .await
        {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }

        debug!(bucket, filename, id = %id, length, "Stored blob");
        Ok(id)
    }

    async fn open_download_stream_by_name(
        &self,
        bucket: &str,
        filename: &str,
    ) -> StoreResult<ByteStream> {
        Self::ensure_bucket_safe(bucket)?;
        let options = FindOptions {
            sort: newest_first(),
            limit: Some(1),
            ..FindOptions::default()
        };
        let newest = self
            .store
            .find(
                &files_collection(bucket),
                &doc(json!({ "filename": filename })),
                &options,
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("blob `{}`", filename)))?;
        let record = BlobMetadataRecord::from_document(newest)?;

        let path = self.blob_path(bucket, &record.id);
        let file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(format!("payload for blob `{}`", filename))
            } else {
                StoreError::Io(err)
            }
        })?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn rename(&self, bucket: &str, id: &ObjectId, new_filename: &str) -> StoreResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        if new_filename.is_empty() {
            return Err(StoreError::InvalidName(new_filename.to_string()));
        }
        let update = doc(json!({ "$set": { "filename": Value::String(new_filename.to_string()) } }));
        let result = self
            .store
            .update_one(&files_collection(bucket), &id_filter(id), &update, false)
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound(format!("blob with id {}", id)));
        }
        Ok(())
    }

    async fn delete(&self, bucket: &str, id: &ObjectId) -> StoreResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        let result = self
            .store
            .delete_one(&files_collection(bucket), &id_filter(id))
            .await?;
        if result.deleted_count == 0 {
            return Err(StoreError::NotFound(format!("blob with id {}", id)));
        }

        let path = self.blob_path(bucket, id);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed blob payload {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, services::document_store::SqliteDocumentStore};
    use futures::{TryStreamExt, stream};
    use tempfile::tempdir;

    fn bytes_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    async fn read_all(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    async fn blob_store(dir: &Path) -> (DiskBlobStore, Arc<dyn DocumentStore>) {
        let pool = db::connect_in_memory().await.unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(Arc::new(pool)));
        (DiskBlobStore::new(store.clone(), dir), store)
    }

    #[tokio::test]
    async fn upload_then_download_by_name() {
        let dir = tempdir().unwrap();
        let (blobs, store) = blob_store(dir.path()).await;

        let id = blobs
            .upload_from_stream("media", "img/a.txt", bytes_stream(vec![b"hello ", b"world"]))
            .await
            .unwrap();

        let record = store
            .find_one("media.files", &id_filter(&id), &Document::new())
            .await
            .unwrap()
            .map(BlobMetadataRecord::from_document)
            .unwrap()
            .unwrap();
        assert_eq!(record.filename, "img/a.txt");
        assert_eq!(record.length, 11);
        assert_eq!(record.md5.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));

        let body = read_all(
            blobs
                .open_download_stream_by_name("media", "img/a.txt")
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn download_prefers_newest_revision() {
        let dir = tempdir().unwrap();
        let (blobs, _) = blob_store(dir.path()).await;
        blobs
            .upload_from_stream("media", "doc.txt", bytes_stream(vec![b"v1"]))
            .await
            .unwrap();
        blobs
            .upload_from_stream("media", "doc.txt", bytes_stream(vec![b"v2"]))
            .await
            .unwrap();
        let body = read_all(
            blobs
                .open_download_stream_by_name("media", "doc.txt")
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"v2");
    }

    #[tokio::test]
    async fn failed_upload_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let (blobs, store) = blob_store(dir.path()).await;
        let failing: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("client went away")),
        ]));
        let err = blobs
            .upload_from_stream("media", "broken.bin", failing)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(store.count("media.files", &Document::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempdir().unwrap();
        let (blobs, _) = blob_store(dir.path()).await;
        let err = blobs
            .open_download_stream_by_name("media", "nope.txt")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));

        let id = ObjectId::new();
        assert!(matches!(
            blobs.rename("media", &id, "x.txt").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            blobs.delete("media", &id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_and_delete_by_id() {
        let dir = tempdir().unwrap();
        let (blobs, store) = blob_store(dir.path()).await;
        let id = blobs
            .upload_from_stream("media", "old.txt", bytes_stream(vec![b"data"]))
            .await
            .unwrap();

        blobs.rename("media", &id, "new.txt").await.unwrap();
        assert!(blobs.open_download_stream_by_name("media", "old.txt").await.is_err());
        let body = read_all(
            blobs
                .open_download_stream_by_name("media", "new.txt")
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body, b"data");

        let payload = blobs.blob_path("media", &id);
        assert!(payload.exists());
        blobs.delete("media", &id).await.unwrap();
        assert!(!payload.exists());
        assert_eq!(store.count("media.files", &Document::new()).await.unwrap(), 0);
        // Shard directories are pruned, the bucket root stays.
        assert!(!payload.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn rejects_unsafe_bucket_names() {
        let dir = tempdir().unwrap();
        let (blobs, _) = blob_store(dir.path()).await;
        for bucket in ["", "../etc", "a/b", ".hidden"] {
            let err = blobs
                .upload_from_stream(bucket, "x", bytes_stream(vec![b"x"]))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidName(_)));
        }
    }
}
