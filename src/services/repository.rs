//! src/services/repository.rs
//!
//! Repository: collection-agnostic CRUD over a `DocumentStore`, decorating
//! writes with timestamps, generated identifiers, name slugs and lazily
//! created uniqueness indexes.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    errors::{RepositoryError, RepositoryResult},
    models::{
        AggregateOptions, DeleteResult, Document, IndexSpec, InsertOptions, ObjectId,
        RepoQueryParams, UpdateOptions, UpdateResult, document::now_timestamp,
    },
    sanitizers::{generate_short_id, sanitize_model_name},
    services::document_store::{DocumentStore, StoreError},
};

const USERS_COLLECTION: &str = "users";

/// Static-style data access helper shared by every handler.
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn DocumentStore>,
}

/// Mirror the store-assigned `_id` into a string `id` field.
fn with_string_id(mut doc: Document) -> Document {
    if let Some(Value::String(id)) = doc.get("_id").cloned() {
        doc.insert("id".to_string(), Value::String(id));
    }
    doc
}

/// A field counts as set unless it is missing, null, `false`, `0` or `""`.
fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

/// Text a scalar `name` is slugged from. Objects and arrays have none.
fn name_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Map an insert failure onto the duplicate-name / duplicate-email / invalid-model kinds.
fn translate_insert_error(err: StoreError) -> RepositoryError {
    match err {
        StoreError::DuplicateKey { ref index, .. } if index == "name_1" => {
            RepositoryError::DuplicateName
        }
        StoreError::DuplicateKey { ref index, .. } if index == "email_1" => {
            RepositoryError::DuplicateEmail
        }
        other => RepositoryError::InvalidModel(other.to_string()),
    }
}

impl Repository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// First record matching `filter`, with `id` populated.
    pub async fn get_one(
        &self,
        collection: &str,
        filter: &Document,
        fields: &Document,
    ) -> RepositoryResult<Option<Document>> {
        let found = self.store.find_one(collection, filter, fields).await?;
        Ok(found.map(with_string_id))
    }

    /// Matching records in store order, each with `id` populated.
    pub async fn get_many(
        &self,
        collection: &str,
        params: &RepoQueryParams,
    ) -> RepositoryResult<Vec<Document>> {
        let docs = self
            .store
            .find(collection, &params.query, &params.find_options())
            .await?;
        Ok(docs.into_iter().map(with_string_id).collect())
    }

    /// Insert one document after stamping dates, slugging its name and
    /// assigning an identifier. Returns the persisted record.
    pub async fn insert_one(
        &self,
        collection: &str,
        doc: Value,
        options: &InsertOptions,
    ) -> RepositoryResult<Document> {
        let Value::Object(mut doc) = doc else {
            return Err(RepositoryError::InvalidInput("Invalid data".into()));
        };

        if options.set_date {
            doc.insert("created".to_string(), now_timestamp());
            doc.insert("modified".to_string(), now_timestamp());
        }

        if !options.create_indexes.is_empty() {
            self.create_indexes(collection, &options.create_indexes).await;
        }
        self.ensure_unique_index(collection).await;

        if !options.preserve_name {
            if let Some(original) = doc.get("name").filter(|v| is_set(Some(*v))).cloned() {
                let text = name_text(&original).ok_or_else(|| {
                    RepositoryError::InvalidInput(
                        "name must be a string, number or boolean".into(),
                    )
                })?;
                if !is_set(doc.get("display_name")) {
                    doc.insert("display_name".to_string(), original);
                }
                doc.insert(
                    "name".to_string(),
                    Value::String(sanitize_model_name(Some(&text))),
                );
            } else if options.auto_generate_name {
                doc.insert("name".to_string(), Value::String(generate_short_id()));
            }
        }

        let id = ObjectId::new();
        let mut record = Document::with_capacity(doc.len() + 2);
        record.insert("_id".to_string(), Value::String(id.to_hex()));
        record.insert("id".to_string(), Value::String(id.to_hex()));
        doc.shift_remove("_id");
        doc.shift_remove("id");
        record.extend(doc);

        self.store
            .insert_one(collection, record)
            .await
            .map_err(translate_insert_error)?;
        debug!(collection, id = %id, "Inserted document");

        let mut by_id = Document::new();
        by_id.insert("_id".to_string(), Value::String(id.to_hex()));
        match self.store.find_one(collection, &by_id, &Document::new()).await {
            Ok(Some(inserted)) => Ok(with_string_id(inserted)),
            Ok(None) => Ok(with_string_id(by_id)),
            Err(err) => {
                warn!(collection, id = %id, error = %err, "Unable to re-fetch inserted document");
                Ok(with_string_id(by_id))
            }
        }
    }

    /// Plain bulk insert with no enrichment.
    pub async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> RepositoryResult<Vec<ObjectId>> {
        Ok(self.store.insert_many(collection, docs).await?)
    }

    /// Merge `partial` into the first match and return the record re-read by `filter`.
    pub async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        mut partial: Document,
        options: &UpdateOptions,
    ) -> RepositoryResult<Option<Document>> {
        if !options.create_indexes.is_empty() {
            self.create_indexes(collection, &options.create_indexes).await;
        }
        partial.shift_remove("_id");
        if options.set_date {
            partial.insert("modified".to_string(), now_timestamp());
            partial.insert("last_modified".to_string(), now_timestamp());
        }
        if partial.is_empty() {
            return self.get_one(collection, filter, &Document::new()).await;
        }

        let mut update = Document::new();
        update.insert("$set".to_string(), Value::Object(partial));
        self.store
            .update_one(collection, filter, &update, options.upsert)
            .await?;

        self.get_one(collection, filter, &Document::new()).await
    }

    /// Pass-through bulk update; `update` must use operators.
    pub async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> RepositoryResult<UpdateResult> {
        Ok(self.store.update_many(collection, filter, update).await?)
    }

    pub async fn delete_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> RepositoryResult<DeleteResult> {
        Ok(self.store.delete_one(collection, filter).await?)
    }

    pub async fn delete_many(
        &self,
        collection: &str,
        filter: &Document,
    ) -> RepositoryResult<DeleteResult> {
        Ok(self.store.delete_many(collection, filter).await?)
    }

    /// True iff at least one record matches.
    pub async fn exists(&self, collection: &str, filter: &Document) -> RepositoryResult<bool> {
        Ok(self.store.count(collection, filter).await? > 0)
    }

    /// First pipeline result, if any.
    pub async fn aggregate_one(
        &self,
        collection: &str,
        pipeline: &[Document],
        options: &AggregateOptions,
    ) -> RepositoryResult<Option<Document>> {
        Ok(self
            .aggregate(collection, pipeline, options)
            .await?
            .into_iter()
            .next())
    }

    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
        options: &AggregateOptions,
    ) -> RepositoryResult<Vec<Document>> {
        let mut docs = self.store.aggregate(collection, pipeline).await?;
        if let Some(max) = options.max_results {
            docs.truncate(max);
        }
        Ok(docs)
    }

    /// Best-effort index creation; failures are logged, not returned.
    pub async fn create_indexes(&self, collection: &str, indexes: &[IndexSpec]) {
        for index in indexes {
            if let Err(err) = self.store.create_index(collection, index).await {
                debug!(collection, index = %index.index_name(), error = %err, "Index creation failed");
            }
        }
    }

    async fn ensure_unique_index(&self, collection: &str) {
        let field = if collection == USERS_COLLECTION {
            "email"
        } else {
            "name"
        };
        self.create_indexes(collection, &[IndexSpec::unique(field)])
            .await;
    }

    /// Parse a raw identifier at an API boundary.
    pub fn validate_object_id(raw: &str) -> RepositoryResult<ObjectId> {
        ObjectId::parse_str(raw).map_err(|err| {
            debug!(error = %err, "Unable to parse object id");
            RepositoryError::InvalidId(raw.to_string())
        })
    }

    /// Turn `"a,b"` into the inclusion projection `{a: true, b: true}`.
    pub fn parse_fields(fields: Option<&str>) -> Document {
        fields
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| (f.to_string(), Value::Bool(true)))
            .collect()
    }
}
