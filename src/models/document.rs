//! Generic document payloads and the option/result types that travel with them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::object_id::ObjectId;

/// An open key/value document. Field order is preserved.
pub type Document = Map<String, Value>;

/// Default page size for `get_many`.
pub const DEFAULT_LIMIT: usize = 1000;

/// Build a `Document` from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty document.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Fixed-width RFC 3339 with millisecond precision, so stored timestamps
/// compare correctly as strings.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> Value {
    Value::String(format_timestamp(Utc::now()))
}

/// Serde adapter writing `DateTime<Utc>` through `format_timestamp`.
pub mod timestamp_format {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(*at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

/// Options forwarded to the store's `find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Document,
    pub sort: Document,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Query parameters accepted by `Repository::get_many`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoQueryParams {
    pub query: Document,
    pub fields: Document,
    pub sort: Document,
    pub skip: usize,
    pub limit: usize,
}

impl Default for RepoQueryParams {
    fn default() -> Self {
        Self {
            query: Document::new(),
            fields: Document::new(),
            sort: Document::new(),
            skip: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl RepoQueryParams {
    pub fn with_query(query: Document) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }

    pub(crate) fn find_options(&self) -> FindOptions {
        FindOptions {
            projection: self.fields.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: Some(self.limit),
        }
    }
}

/// Ordered index keys with a uniqueness flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub keys: Vec<(String, i32)>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl IndexSpec {
    /// Single-field ascending unique index, e.g. `name_1`.
    pub fn unique(field: &str) -> Self {
        Self {
            keys: vec![(field.to_string(), 1)],
            unique: true,
            name: None,
        }
    }

    /// Explicit name, or the keys joined as `field_dir`.
    pub fn index_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Behaviour switches for `Repository::insert_one`.
#[derive(Debug, Clone)]
pub struct InsertOptions {
    pub set_date: bool,
    pub auto_generate_name: bool,
    pub preserve_name: bool,
    pub create_indexes: Vec<IndexSpec>,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            set_date: true,
            auto_generate_name: true,
            preserve_name: false,
            create_indexes: Vec::new(),
        }
    }
}

/// Behaviour switches for `Repository::update_one`.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub upsert: bool,
    pub set_date: bool,
    pub create_indexes: Vec<IndexSpec>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            upsert: false,
            set_date: true,
            create_indexes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Truncate the pipeline output to at most this many documents.
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<ObjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub deleted_count: u64,
}
