//! Core data models for the document repository.
//!
//! Documents are open JSON objects; blobs are described by a typed metadata
//! record stored alongside them. Identifiers use the store-native `ObjectId`.

pub mod blob;
pub mod document;
pub mod object_id;

pub use blob::{BlobMetadataRecord, DeleteConfirmation, FileKey};
pub use document::{
    AggregateOptions, DeleteResult, Document, FindOptions, IndexSpec, InsertOptions,
    RepoQueryParams, UpdateOptions, UpdateResult,
};
pub use object_id::ObjectId;
