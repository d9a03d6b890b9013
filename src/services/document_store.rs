//! src/services/document_store.rs
//!
//! DocumentStore: collection-scoped find/insert/update/delete/count/aggregate
//! over JSON documents. `SqliteDocumentStore` keeps every collection in one
//! SQLite table and evaluates filters in process (see `services::query`).
//! Unique indexes are partial expression indexes on `json_extract(body, ...)`,
//! so uniqueness is enforced atomically by SQLite itself.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::debug;

use crate::{
    models::{DeleteResult, Document, FindOptions, IndexSpec, ObjectId, UpdateResult},
    services::query::{self, QueryError},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key on index `{index}`: {message}")]
    DuplicateKey { index: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid name `{0}`")]
    InvalidName(String),
    #[error("document `_id` must be a valid object id")]
    InvalidDocumentId,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Sqlx(sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                let message = db_err.message().to_string();
                StoreError::DuplicateKey {
                    index: violated_index(&message),
                    message,
                }
            }
            _ => StoreError::Sqlx(err),
        }
    }
}

/// Extract the logical index name from a SQLite unique-constraint message.
///
/// Expression indexes report `index '<collection>$<name>'`; the primary key
/// reports the `documents.id` column and maps to `_id_`.
fn violated_index(message: &str) -> String {
    if let Some(start) = message.find("index '") {
        let rest = &message[start + "index '".len()..];
        let raw = rest.split('\'').next().unwrap_or(rest);
        return raw
            .split_once('$')
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| raw.to_string());
    }
    if message.contains("documents.id") {
        return "_id_".to_string();
    }
    message.to_string()
}

/// Collection-scoped document operations.
///
/// Implementations must be `Send + Sync`; callers share one handle.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// First matching document in natural order, projected.
    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        projection: &Document,
    ) -> StoreResult<Option<Document>>;

    /// Matching documents, sorted, paged and projected.
    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>>;

    /// Insert one document, assigning `_id` when absent.
    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<ObjectId>;

    /// Insert all documents or none.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>)
    -> StoreResult<Vec<ObjectId>>;

    /// Apply an operator update to the first match.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    /// Apply an operator update to every match.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateResult>;

    async fn delete_one(&self, collection: &str, filter: &Document) -> StoreResult<DeleteResult>;

    async fn delete_many(&self, collection: &str, filter: &Document)
    -> StoreResult<DeleteResult>;

    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64>;

    /// Run an aggregation pipeline over the whole collection.
    async fn aggregate(&self, collection: &str, pipeline: &[Document])
    -> StoreResult<Vec<Document>>;

    /// Create an index if it does not exist yet. Returns the index name.
    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<String>;
}

/// `DocumentStore` backed by a shared SQLite pool.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: Arc<SqlitePool>,
}

impl SqliteDocumentStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Read the `_id` of a document, or assign a fresh one at the front.
fn ensure_id(doc: Document) -> StoreResult<(ObjectId, Document)> {
    match doc.get("_id") {
        Some(Value::String(raw)) => {
            let id = ObjectId::parse_str(raw).map_err(|_| StoreError::InvalidDocumentId)?;
            Ok((id, doc))
        }
        Some(_) => Err(StoreError::InvalidDocumentId),
        None => {
            let id = ObjectId::new();
            let mut with_id = Document::with_capacity(doc.len() + 1);
            with_id.insert("_id".to_string(), Value::String(id.to_hex()));
            with_id.extend(doc);
            Ok((id, with_id))
        }
    }
}

/// Rows of `collection` matching `filter`, in natural order.
async fn load_matching(
    conn: &mut SqliteConnection,
    collection: &str,
    filter: &Document,
) -> StoreResult<Vec<(String, Document)>> {
    let rows: Vec<(String, String)> = match filter.get("_id") {
        Some(Value::String(id)) => {
            sqlx::query_as(
                "SELECT id, body FROM documents WHERE collection = ? AND id = ? ORDER BY seq",
            )
            .bind(collection)
            .bind(id)
            .fetch_all(&mut *conn)
            .await?
        }
        _ => {
            sqlx::query_as("SELECT id, body FROM documents WHERE collection = ? ORDER BY seq")
                .bind(collection)
                .fetch_all(&mut *conn)
                .await?
        }
    };

    let mut matched = Vec::new();
    for (id, body) in rows {
        let doc: Document = serde_json::from_str(&body)?;
        if query::matches(&doc, filter)? {
            matched.push((id, doc));
        }
    }
    Ok(matched)
}

async fn insert_row(
    conn: &mut SqliteConnection,
    collection: &str,
    doc: Document,
) -> StoreResult<ObjectId> {
    let (id, doc) = ensure_id(doc)?;
    let body = serde_json::to_string(&doc)?;
    sqlx::query("INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)")
        .bind(collection)
        .bind(id.to_hex())
        .bind(body)
        .execute(&mut *conn)
        .await?;
    Ok(id)
}

async fn write_body(
    conn: &mut SqliteConnection,
    collection: &str,
    id: &str,
    doc: &Document,
) -> StoreResult<()> {
    sqlx::query("UPDATE documents SET body = ? WHERE collection = ? AND id = ?")
        .bind(serde_json::to_string(doc)?)
        .bind(collection)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_row(conn: &mut SqliteConnection, collection: &str, id: &str) -> StoreResult<u64> {
    let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
        .bind(collection)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

fn quote_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

/// JSON path for a dotted field, quoting segments that are not plain words.
fn json_path(field: &str) -> String {
    let mut path = String::from("$");
    for segment in field.split('.') {
        path.push('.');
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            path.push_str(segment);
        } else {
            path.push('"');
            path.push_str(&segment.replace('"', "\\\""));
            path.push('"');
        }
    }
    path
}

fn index_sql(collection: &str, index: &IndexSpec) -> StoreResult<String> {
    if index.keys.is_empty() {
        return Err(StoreError::InvalidName(index.index_name()));
    }
    let columns = index
        .keys
        .iter()
        .map(|(field, dir)| {
            format!(
                "json_extract(body, {}) {}",
                quote_literal(&json_path(field)),
                if *dir < 0 { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON documents ({}) WHERE collection = {}",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&format!("{}${}", collection, index.index_name())),
        columns,
        quote_literal(collection)
    ))
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        projection: &Document,
    ) -> StoreResult<Option<Document>> {
        let mut conn = self.pool.acquire().await?;
        let matched = load_matching(&mut conn, collection, filter).await?;
        match matched.into_iter().next() {
            Some((_, doc)) => Ok(Some(query::project(&doc, projection)?)),
            None => Ok(None),
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let mut conn = self.pool.acquire().await?;
        let mut docs: Vec<Document> = load_matching(&mut conn, collection, filter)
            .await?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect();
        query::sort_documents(&mut docs, &options.sort)?;

        docs.into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|doc| query::project(&doc, &options.projection).map_err(StoreError::from))
            .collect()
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<ObjectId> {
        let mut conn = self.pool.acquire().await?;
        insert_row(&mut conn, collection, doc).await
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> StoreResult<Vec<ObjectId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(insert_row(&mut tx, collection, doc).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        query::ensure_operator_update(update)?;
        let mut tx = self.pool.begin().await?;
        let matched = load_matching(&mut tx, collection, filter).await?;

        let result = match matched.into_iter().next() {
            Some((id, mut doc)) => {
                let modified = query::apply_update(&mut doc, update)?;
                if modified {
                    write_body(&mut tx, collection, &id, &doc).await?;
                }
                UpdateResult {
                    matched_count: 1,
                    modified_count: modified as u64,
                    upserted_id: None,
                }
            }
            None if upsert => {
                let mut seed = query::equality_fields(filter);
                query::apply_update(&mut seed, update)?;
                let id = insert_row(&mut tx, collection, seed).await?;
                UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                    upserted_id: Some(id),
                }
            }
            None => UpdateResult::default(),
        };

        tx.commit().await?;
        Ok(result)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> StoreResult<UpdateResult> {
        query::ensure_operator_update(update)?;
        let mut tx = self.pool.begin().await?;
        let matched = load_matching(&mut tx, collection, filter).await?;

        let mut result = UpdateResult::default();
        for (id, mut doc) in matched {
            result.matched_count += 1;
            if query::apply_update(&mut doc, update)? {
                write_body(&mut tx, collection, &id, &doc).await?;
                result.modified_count += 1;
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> StoreResult<DeleteResult> {
        let mut tx = self.pool.begin().await?;
        let matched = load_matching(&mut tx, collection, filter).await?;
        let deleted_count = match matched.first() {
            Some((id, _)) => delete_row(&mut tx, collection, id).await?,
            None => 0,
        };
        tx.commit().await?;
        Ok(DeleteResult { deleted_count })
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
    ) -> StoreResult<DeleteResult> {
        let mut tx = self.pool.begin().await?;
        let matched = load_matching(&mut tx, collection, filter).await?;
        let mut deleted_count = 0;
        for (id, _) in &matched {
            deleted_count += delete_row(&mut tx, collection, id).await?;
        }
        tx.commit().await?;
        Ok(DeleteResult { deleted_count })
    }

    async fn count(&self, collection: &str, filter: &Document) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let matched = load_matching(&mut conn, collection, filter).await?;
        Ok(matched.len() as u64)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> StoreResult<Vec<Document>> {
        let mut conn = self.pool.acquire().await?;
        let docs = load_matching(&mut conn, collection, &Document::new())
            .await?
            .into_iter()
            .map(|(_, doc)| doc)
            .collect();
        Ok(query::run_pipeline(docs, pipeline)?)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<String> {
        let sql = index_sql(collection, index)?;
        debug!(collection, sql = %sql, "Creating index");
        sqlx::query(&sql).execute(&*self.pool).await?;
        Ok(index.index_name())
    }
}
