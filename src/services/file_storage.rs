//! src/services/file_storage.rs
//!
//! FileStorage: blob operations on top of a `BlobStore`, with metadata read
//! and patched through the `Repository`.
//!
//! Downloads go through a read-through cache on the local filesystem: a file
//! under `cache_root/{filename}` is reused only while its modification time is
//! strictly newer than the blob's `uploadDate`. Staleness is detected on every
//! read; nothing is invalidated explicitly.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    errors::{RepositoryError, RepositoryResult},
    models::{
        BlobMetadataRecord, DeleteConfirmation, Document, FileKey, ObjectId, RepoQueryParams,
        UpdateOptions,
        blob::{files_collection, newest_first, strip_query_suffix},
        document::doc,
    },
    services::{
        blob_store::{BlobStore, ByteStream},
        document_store::StoreError,
        repository::Repository,
    },
};

/// Fields owned by the blob store; metadata updates never touch them.
const RESERVED_FIELDS: [&str; 6] = ["_id", "id", "filename", "length", "md5", "uploadDate"];

#[derive(Clone)]
pub struct FileStorage {
    repository: Repository,
    blobs: Arc<dyn BlobStore>,
    default_bucket: String,
}

fn decode_record(doc: Document) -> RepositoryResult<BlobMetadataRecord> {
    BlobMetadataRecord::from_document(doc).map_err(|err| RepositoryError::Store(StoreError::Json(err)))
}

fn describe(query: &Document) -> String {
    serde_json::Value::Object(query.clone()).to_string()
}

/// Upload-side store failures: I/O becomes a stream error, the rest pass through.
fn upload_error(err: StoreError) -> RepositoryError {
    match err {
        StoreError::Io(err) => RepositoryError::Stream(err),
        other => RepositoryError::Store(other),
    }
}

/// Download-side failures are all stream errors, keeping the cause.
fn download_error(err: StoreError) -> RepositoryError {
    match err {
        StoreError::Io(err) => RepositoryError::Stream(err),
        other => RepositoryError::Stream(io::Error::other(other)),
    }
}

/// Create `dir` and any missing parents. Succeeds if it already exists.
pub async fn materialize_dir(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir).await {
        Err(err) if err.kind() != io::ErrorKind::AlreadyExists => Err(err),
        _ => Ok(()),
    }
}

/// Local cache location for `filename`. Leading `/` is dropped and any
/// non-plain component (`..`, root) is rejected.
pub fn cache_path(cache_root: &Path, filename: &str) -> RepositoryResult<PathBuf> {
    let relative = Path::new(filename.trim_start_matches('/'));
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(RepositoryError::InvalidInput(format!(
            "cannot cache file name `{}`",
            filename
        )));
    }
    Ok(cache_root.join(relative))
}

/// True if `local` exists and was modified strictly after `uploaded`.
async fn is_cache_fresh(local: &Path, uploaded: DateTime<Utc>) -> bool {
    match fs::metadata(local).await {
        Ok(meta) if meta.is_file() => meta
            .modified()
            .map(|mtime| DateTime::<Utc>::from(mtime) > uploaded)
            .unwrap_or(false),
        _ => false,
    }
}

impl FileStorage {
    pub fn new(
        repository: Repository,
        blobs: Arc<dyn BlobStore>,
        default_bucket: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            blobs,
            default_bucket: default_bucket.into(),
        }
    }

    /// Bucket configured at startup, for callers that do not pick one.
    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// Newest metadata record matching `query`.
    pub async fn get_one_file_info(
        &self,
        query: &Document,
        bucket: &str,
    ) -> RepositoryResult<Option<BlobMetadataRecord>> {
        let params = RepoQueryParams {
            query: query.clone(),
            sort: newest_first(),
            limit: 1,
            ..RepoQueryParams::default()
        };
        self.repository
            .get_many(&files_collection(bucket), &params)
            .await?
            .into_iter()
            .next()
            .map(decode_record)
            .transpose()
    }

    pub async fn get_many_file_info(
        &self,
        params: &RepoQueryParams,
        bucket: &str,
    ) -> RepositoryResult<Vec<BlobMetadataRecord>> {
        self.repository
            .get_many(&files_collection(bucket), params)
            .await?
            .into_iter()
            .map(decode_record)
            .collect()
    }

    /// Resolve `query` to a blob and return the absolute path of a local copy,
    /// downloading it unless a fresh cached copy exists.
    pub async fn get_file_data(
        &self,
        query: &Document,
        cache_root: &Path,
        bucket: &str,
    ) -> RepositoryResult<PathBuf> {
        let info = self
            .get_one_file_info(query, bucket)
            .await?
            .ok_or_else(|| RepositoryError::FileNotFound(describe(query)))?;
        let local = cache_path(cache_root, &info.filename)?;

        if is_cache_fresh(&local, info.upload_date).await {
            debug!(filename = %info.filename, path = %local.display(), "Using cached version");
            return fs::canonicalize(&local).await.map_err(RepositoryError::Stream);
        }

        if let Some(dir) = local.parent() {
            if let Err(err) = materialize_dir(dir).await {
                warn!(dir = %dir.display(), error = %err, "Unable to create cache directory");
            }
        }

        debug!(filename = %info.filename, path = %local.display(), "Cache miss, opening stream");
        self.copy_to_cache(bucket, &info.filename, &local).await?;
        debug!(filename = %info.filename, "Stream finished");

        fs::canonicalize(&local).await.map_err(RepositoryError::Stream)
    }

    /// Copy the newest revision of `filename` into `local`. A partially written
    /// file is removed on failure.
    async fn copy_to_cache(&self, bucket: &str, filename: &str, local: &Path) -> RepositoryResult<()> {
        let mut stream = self
            .blobs
            .open_download_stream_by_name(bucket, filename)
            .await
            .map_err(download_error)?;
        let mut file = File::create(local).await.map_err(RepositoryError::Stream)?;

        let copied = async {
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await
        }
        .await;

        if let Err(err) = copied {
            warn!(filename, path = %local.display(), error = %err, "Stream error");
            drop(file);
            let _ = fs::remove_file(local).await;
            return Err(RepositoryError::Stream(err));
        }
        Ok(())
    }

    /// Upload the file at `source` as `folder_and_filename` (any `?query`
    /// suffix dropped), then merge `extra` into its metadata. A failed merge
    /// is logged and the unpatched record is returned.
    pub async fn create_file_from_path(
        &self,
        source: impl AsRef<Path>,
        folder_and_filename: &str,
        extra: Option<Document>,
        bucket: &str,
    ) -> RepositoryResult<BlobMetadataRecord> {
        if folder_and_filename.is_empty() {
            return Err(RepositoryError::MissingFilename);
        }
        let source = source.as_ref();
        if source.as_os_str().is_empty() {
            return Err(RepositoryError::MissingSource);
        }
        let filename = strip_query_suffix(folder_and_filename);
        if filename.is_empty() {
            return Err(RepositoryError::MissingFilename);
        }

        let uploaded = self.begin_upload(source, filename, bucket).await?;

        match extra.filter(|fields| !fields.is_empty()) {
            Some(fields) => {
                match self
                    .update_file_metadata(&FileKey::ById(uploaded.id), fields, bucket)
                    .await
                {
                    Ok(patched) => Ok(patched),
                    Err(err) => {
                        warn!(
                            filename,
                            id = %uploaded.id,
                            error = %err,
                            "Metadata patch failed after upload, returning unpatched record"
                        );
                        Ok(uploaded)
                    }
                }
            }
            None => Ok(uploaded),
        }
    }

    async fn begin_upload(
        &self,
        source: &Path,
        filename: &str,
        bucket: &str,
    ) -> RepositoryResult<BlobMetadataRecord> {
        let file = File::open(source).await.map_err(RepositoryError::Stream)?;
        let stream: ByteStream = Box::pin(ReaderStream::new(file));
        let id = self
            .blobs
            .upload_from_stream(bucket, filename, stream)
            .await
            .map_err(upload_error)?;
        info!(filename, id = %id, "{} upload complete.", filename);

        self.get_one_file_info(&FileKey::ById(id).to_filter(), bucket)
            .await?
            .ok_or_else(|| RepositoryError::FileNotFound(filename.to_string()))
    }

    /// Merge `data` into the record identified by `key` and return the refreshed record.
    pub async fn update_file_metadata(
        &self,
        key: &FileKey,
        mut data: Document,
        bucket: &str,
    ) -> RepositoryResult<BlobMetadataRecord> {
        let current = self
            .get_one_file_info(&key.to_filter(), bucket)
            .await?
            .ok_or_else(|| RepositoryError::FileNotFound(describe(&key.to_filter())))?;
        for field in RESERVED_FIELDS {
            data.shift_remove(field);
        }
        debug!(id = %current.id, bucket, fields = data.len(), "Updating file metadata");

        let updated = self
            .repository
            .update_one(
                &files_collection(bucket),
                &doc(json!({ "_id": current.id.to_hex() })),
                data,
                &UpdateOptions::default(),
            )
            .await?
            .ok_or_else(|| RepositoryError::FileNotFound(current.id.to_hex()))?;
        decode_record(updated)
    }

    /// Give the blob `id` a new filename (any `?query` suffix dropped).
    pub async fn rename_file(
        &self,
        id: &ObjectId,
        new_filename: &str,
        bucket: &str,
    ) -> RepositoryResult<BlobMetadataRecord> {
        let new_filename = strip_query_suffix(new_filename);
        if new_filename.is_empty() {
            return Err(RepositoryError::MissingFilename);
        }
        if let Err(source) = self.blobs.rename(bucket, id, new_filename).await {
            warn!(id = %id, error = %source, "Unable to rename file");
            return Err(RepositoryError::RenameFailed { id: *id, source });
        }
        self.get_one_file_info(&FileKey::ById(*id).to_filter(), bucket)
            .await?
            .ok_or_else(|| RepositoryError::FileNotFound(id.to_hex()))
    }

    pub async fn delete_file(
        &self,
        id: &ObjectId,
        bucket: &str,
    ) -> RepositoryResult<DeleteConfirmation> {
        if let Err(source) = self.blobs.delete(bucket, id).await {
            warn!(id = %id, error = %source, "Unable to delete file");
            return Err(RepositoryError::DeleteFailed { id: *id, source });
        }
        Ok(DeleteConfirmation { deleted: true })
    }
}
