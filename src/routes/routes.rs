//! Defines routes for document collections and blob storage.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `POST   /collections/{collection}` insert a document
//!   - `GET    /collections/{collection}/{id}` fetch by id (`?fields=a,b`)
//!   - `PATCH  /collections/{collection}/{id}` merge fields into a document
//!   - `DELETE /collections/{collection}/{id}` delete by id
//!   - `POST   /collections/{collection}/find`, `/find-one`, `/aggregate`, `/exists`
//!
//! - **File endpoints** (all accept `?bucket=`)
//!   - `PUT    /files/{*filename}` upload, `x-file-meta-*` headers become metadata
//!   - `GET    /files/{*filename}` download through the local cache
//!   - `GET    /file-meta/{*key}`, `PATCH /file-meta/{*key}` metadata by id or filename
//!   - `POST   /blobs/{id}/rename`, `DELETE /blobs/{id}`
//!
//! The wildcard `*filename` allows nested names like `reports/2025/q1.pdf`.

use crate::{
    handlers::{
        document_handlers::{
            aggregate_documents, delete_document, document_exists, find_documents,
            find_one_document, get_document, insert_document, update_document,
        },
        file_handlers::{
            delete_blob, download_file, get_file_meta, rename_blob, update_file_meta, upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build the router; handlers share `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Collection routes
        .route("/collections/{collection}", post(insert_document))
        .route("/collections/{collection}/find", post(find_documents))
        .route("/collections/{collection}/find-one", post(find_one_document))
        .route("/collections/{collection}/aggregate", post(aggregate_documents))
        .route("/collections/{collection}/exists", post(document_exists))
        .route(
            "/collections/{collection}/{id}",
            get(get_document)
                .patch(update_document)
                .delete(delete_document),
        )
        // File routes
        .route("/files/{*filename}", put(upload_file).get(download_file))
        .route("/file-meta/{*key}", get(get_file_meta).patch(update_file_meta))
        .route("/blobs/{id}/rename", post(rename_blob))
        .route("/blobs/{id}", delete(delete_blob))
}
