//! HTTP handlers for blobs and their metadata.
//! Bodies are streamed to and from disk; storage concerns stay in `FileStorage`.

use crate::{
    errors::{AppError, RepositoryError},
    models::{BlobMetadataRecord, DeleteConfirmation, Document, FileKey},
    services::{file_storage::materialize_dir, repository::Repository},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

/// Request headers with this prefix become extra metadata on upload.
pub const META_HEADER_PREFIX: &str = "x-file-meta-";

#[derive(Debug, Default, Deserialize)]
pub struct BucketQuery {
    pub bucket: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameReq {
    pub filename: String,
}

/// `x-file-meta-owner: ops` → `{"owner": "ops"}`. Non UTF-8 values are skipped.
fn extra_metadata(headers: &HeaderMap) -> Option<Document> {
    let extra: Document = headers
        .iter()
        .filter_map(|(name, value)| {
            let field = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            (!field.is_empty()).then(|| (field.to_string(), Value::String(value.to_string())))
        })
        .collect();
    (!extra.is_empty()).then_some(extra)
}

/// Spool the request body into `path`, removing it on failure.
async fn spool_body(body: Body, path: &std::path::Path) -> Result<(), AppError> {
    let mut file = File::create(path)
        .await
        .map_err(|e| AppError::internal(format!("could not create upload file: {}", e)))?;
    let mut stream = body.into_data_stream();
    let written = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(std::io::Error::other)?;
            file.write_all(&chunk).await?;
        }
        file.flush().await
    }
    .await;
    if let Err(err) = written {
        drop(file);
        let _ = fs::remove_file(path).await;
        return Err(RepositoryError::Stream(err).into());
    }
    Ok(())
}

/// PUT `/files/{*filename}`: upload the request body as `filename`.
pub async fn upload_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(q): Query<BucketQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let bucket = state.bucket(q.bucket.as_deref()).to_string();
    let spool_dir = state.cache_root.join(".uploads");
    materialize_dir(&spool_dir)
        .await
        .map_err(|e| AppError::internal(format!("could not create upload dir: {}", e)))?;
    let spool: PathBuf = spool_dir.join(Uuid::new_v4().to_string());

    spool_body(body, &spool).await?;
    let result = state
        .files
        .create_file_from_path(&spool, &filename, extra_metadata(&headers), &bucket)
        .await;
    if let Err(err) = fs::remove_file(&spool).await {
        warn!(path = %spool.display(), error = %err, "Could not remove upload spool file");
    }

    Ok((StatusCode::CREATED, Json(result?)))
}

/// GET `/files/{*filename}`: stream the newest revision via the local cache.
pub async fn download_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(q): Query<BucketQuery>,
) -> Result<Response, AppError> {
    let bucket = state.bucket(q.bucket.as_deref());
    let query = FileKey::ByFilename(filename).to_filter();
    let path = state
        .files
        .get_file_data(&query, &state.cache_root, bucket)
        .await?;

    let file = File::open(&path).await.map_err(RepositoryError::Stream)?;
    let len = file.metadata().await.map_err(RepositoryError::Stream)?.len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// GET `/file-meta/{*key}`: key is an identifier or a filename.
pub async fn get_file_meta(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<BucketQuery>,
) -> Result<Json<BlobMetadataRecord>, AppError> {
    let bucket = state.bucket(q.bucket.as_deref());
    let filter = FileKey::parse(&key).to_filter();
    state
        .files
        .get_one_file_info(&filter, bucket)
        .await?
        .map(Json)
        .ok_or_else(|| RepositoryError::FileNotFound(key).into())
}

/// PATCH `/file-meta/{*key}`: merge the body into the blob's metadata.
pub async fn update_file_meta(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<BucketQuery>,
    Json(body): Json<Value>,
) -> Result<Json<BlobMetadataRecord>, AppError> {
    let bucket = state.bucket(q.bucket.as_deref());
    let Value::Object(data) = body else {
        return Err(AppError::bad_request("metadata must be a JSON object"));
    };
    let record = state
        .files
        .update_file_metadata(&FileKey::parse(&key), data, bucket)
        .await?;
    Ok(Json(record))
}

/// POST `/blobs/{id}/rename` with `{"filename": "..."}`.
pub async fn rename_blob(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<BucketQuery>,
    Json(req): Json<RenameReq>,
) -> Result<Json<BlobMetadataRecord>, AppError> {
    let bucket = state.bucket(q.bucket.as_deref());
    let id = Repository::validate_object_id(&id)?;
    let record = state.files.rename_file(&id, &req.filename, bucket).await?;
    Ok(Json(record))
}

/// DELETE `/blobs/{id}`
pub async fn delete_blob(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<BucketQuery>,
) -> Result<Json<DeleteConfirmation>, AppError> {
    let bucket = state.bucket(q.bucket.as_deref());
    let id = Repository::validate_object_id(&id)?;
    let confirmation = state.files.delete_file(&id, bucket).await?;
    Ok(Json(confirmation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_headers_become_extra_fields() {
        let mut headers = HeaderMap::new();
        headers.insert("x-file-meta-owner", HeaderValue::from_static("ops"));
        headers.insert("x-file-meta-", HeaderValue::from_static("ignored"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let extra = extra_metadata(&headers).unwrap();
        assert_eq!(Value::Object(extra), json!({"owner": "ops"}));
    }

    #[test]
    fn no_meta_headers_means_no_extra() {
        assert!(extra_metadata(&HeaderMap::new()).is_none());
    }
}
