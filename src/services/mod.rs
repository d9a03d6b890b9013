pub mod blob_store;
pub mod document_store;
pub mod file_storage;
pub mod query;
pub mod repository;
