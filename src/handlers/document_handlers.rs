//! HTTP handlers for document collections.
//! Thin wrappers: request shapes in, `Repository` calls, JSON out.

use crate::{
    errors::AppError,
    models::{
        AggregateOptions, DeleteResult, Document, IndexSpec, InsertOptions, RepoQueryParams,
        UpdateOptions, document::doc,
    },
    services::repository::Repository,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Query params accepted by `POST /collections/{collection}`.
#[derive(Debug, Default, Deserialize)]
pub struct InsertQuery {
    pub set_date: Option<bool>,
    pub auto_generate_name: Option<bool>,
    pub preserve_name: Option<bool>,
    /// Comma separated fields that get a unique index before the insert.
    pub unique: Option<String>,
}

impl InsertQuery {
    fn options(&self) -> InsertOptions {
        let defaults = InsertOptions::default();
        InsertOptions {
            set_date: self.set_date.unwrap_or(defaults.set_date),
            auto_generate_name: self.auto_generate_name.unwrap_or(defaults.auto_generate_name),
            preserve_name: self.preserve_name.unwrap_or(defaults.preserve_name),
            create_indexes: self
                .unique
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(IndexSpec::unique)
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FieldsQuery {
    /// Comma separated inclusion projection, e.g. `?fields=name,email`.
    pub fields: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateQuery {
    pub upsert: Option<bool>,
    pub set_date: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FindOneReq {
    pub query: Document,
    pub fields: Document,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AggregateReq {
    pub pipeline: Vec<Document>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExistsReq {
    pub query: Document,
}

#[derive(Debug, Serialize)]
pub struct ExistsResp {
    pub exists: bool,
}

fn id_filter(raw: &str) -> Result<Document, AppError> {
    let id = Repository::validate_object_id(raw)?;
    Ok(doc(json!({ "_id": id.to_hex() })))
}

fn not_found(collection: &str, what: &str) -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        format!("no document {} in `{}`", what, collection),
    )
}

/// POST `/collections/{collection}`: insert one document.
pub async fn insert_document(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(q): Query<InsertQuery>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let saved = state
        .repository
        .insert_one(&collection, body, &q.options())
        .await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

/// GET `/collections/{collection}/{id}`
pub async fn get_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(q): Query<FieldsQuery>,
) -> Result<Json<Document>, AppError> {
    let filter = id_filter(&id)?;
    let fields = Repository::parse_fields(q.fields.as_deref());
    state
        .repository
        .get_one(&collection, &filter, &fields)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&collection, &id))
}

/// PATCH `/collections/{collection}/{id}`: merge the body into the document.
pub async fn update_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(q): Query<UpdateQuery>,
    Json(body): Json<Value>,
) -> Result<Json<Document>, AppError> {
    let filter = id_filter(&id)?;
    let Value::Object(partial) = body else {
        return Err(AppError::bad_request("update body must be a JSON object"));
    };
    let defaults = UpdateOptions::default();
    let options = UpdateOptions {
        upsert: q.upsert.unwrap_or(defaults.upsert),
        set_date: q.set_date.unwrap_or(defaults.set_date),
        create_indexes: Vec::new(),
    };
    state
        .repository
        .update_one(&collection, &filter, partial, &options)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&collection, &id))
}

/// DELETE `/collections/{collection}/{id}`
pub async fn delete_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<DeleteResult>, AppError> {
    let filter = id_filter(&id)?;
    let result = state.repository.delete_one(&collection, &filter).await?;
    Ok(Json(result))
}

/// POST `/collections/{collection}/find`
pub async fn find_documents(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(params): Json<RepoQueryParams>,
) -> Result<Json<Vec<Document>>, AppError> {
    let docs = state.repository.get_many(&collection, &params).await?;
    Ok(Json(docs))
}

/// POST `/collections/{collection}/find-one`
pub async fn find_one_document(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<FindOneReq>,
) -> Result<Json<Document>, AppError> {
    state
        .repository
        .get_one(&collection, &req.query, &req.fields)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&collection, "matching the query"))
}

/// POST `/collections/{collection}/aggregate`
pub async fn aggregate_documents(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<AggregateReq>,
) -> Result<Json<Vec<Document>>, AppError> {
    let options = AggregateOptions {
        max_results: req.max_results,
    };
    let docs = state
        .repository
        .aggregate(&collection, &req.pipeline, &options)
        .await?;
    Ok(Json(docs))
}

/// POST `/collections/{collection}/exists`
pub async fn document_exists(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<ExistsReq>,
) -> Result<Json<ExistsResp>, AppError> {
    let exists = state.repository.exists(&collection, &req.query).await?;
    Ok(Json(ExistsResp { exists }))
}
