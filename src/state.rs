use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

use crate::services::{file_storage::FileStorage, repository::Repository};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub repository: Repository,
    pub files: FileStorage,
    pub db: Arc<SqlitePool>,
    /// Root of the local download cache.
    pub cache_root: PathBuf,
}

impl AppState {
    /// Bucket from `?bucket=` or the configured default.
    pub fn bucket<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => self.files.default_bucket(),
        }
    }
}
