//! Metadata record kept for every stored blob, plus the key used to look one up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{document::Document, object_id::ObjectId};

/// Metadata describing a single blob in a bucket.
///
/// The record is stored as a document in the `{bucket}.files` collection.
/// `id`, `length`, `md5` and `upload_date` are set by the blob store at upload
/// time; `filename` changes on rename; everything else lands in `extra` and is
/// merged (never replaced) by metadata updates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BlobMetadataRecord {
    /// Identifier assigned by the blob store.
    #[serde(rename = "_id")]
    pub id: ObjectId,

    /// Virtual path of the blob, `/`-delimited.
    pub filename: String,

    /// Payload size in bytes.
    #[serde(default)]
    pub length: i64,

    /// Hex md5 digest of the payload.
    #[serde(default)]
    pub md5: Option<String>,

    /// Instant the upload completed.
    #[serde(rename = "uploadDate", with = "crate::models::document::timestamp_format")]
    pub upload_date: DateTime<Utc>,

    /// Caller-supplied fields.
    #[serde(flatten)]
    pub extra: Document,
}

impl BlobMetadataRecord {
    /// Decode a stored document, dropping the mirrored string `id`.
    pub fn from_document(mut doc: Document) -> serde_json::Result<Self> {
        doc.shift_remove("id");
        serde_json::from_value(Value::Object(doc))
    }

    pub fn to_document(&self) -> Document {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Document::new(),
        }
    }
}

/// Collection holding the metadata records for `bucket`.
pub fn files_collection(bucket: &str) -> String {
    format!("{}.files", bucket)
}

/// How a caller identifies a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKey {
    ByFilename(String),
    ById(ObjectId),
}

impl FileKey {
    /// Treat `raw` as an identifier when it parses as one, else as a filename.
    pub fn parse(raw: &str) -> Self {
        match ObjectId::parse_str(raw) {
            Ok(id) => FileKey::ById(id),
            Err(_) => FileKey::ByFilename(raw.to_string()),
        }
    }

    pub fn to_filter(&self) -> Document {
        let value = match self {
            FileKey::ByFilename(name) => json!({ "filename": name }),
            FileKey::ById(id) => json!({ "_id": id.to_hex() }),
        };
        match value {
            Value::Object(map) => map,
            _ => Document::new(),
        }
    }
}

/// Returned by a successful blob delete.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteConfirmation {
    pub deleted: bool,
}

/// Sort placing the newest revision of a filename first.
pub fn newest_first() -> Document {
    match json!({ "uploadDate": -1, "_id": -1 }) {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Drop any `?query` suffix from a target filename.
pub fn strip_query_suffix(filename: &str) -> &str {
    filename.split('?').next().unwrap_or(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_key_prefers_identifier_when_it_parses() {
        let id = ObjectId::new();
        assert_eq!(FileKey::parse(&id.to_hex()), FileKey::ById(id));
        assert_eq!(
            FileKey::parse("reports/q1.pdf"),
            FileKey::ByFilename("reports/q1.pdf".into())
        );
    }

    #[test]
    fn strips_query_suffix() {
        assert_eq!(strip_query_suffix("a/b.png?ver=2"), "a/b.png");
        assert_eq!(strip_query_suffix("a/b.png"), "a/b.png");
        assert_eq!(strip_query_suffix("?x"), "");
    }

    #[test]
    fn record_roundtrips_through_document_with_extra_fields() {
        let id = ObjectId::new();
        let stored = json!({
            "_id": id.to_hex(),
            "id": id.to_hex(),
            "filename": "img/logo.png",
            "length": 42,
            "md5": "abc",
            "uploadDate": "2026-01-02T03:04:05.678Z",
            "owner": "ops",
        });
        let Value::Object(map) = stored else { unreachable!() };
        let record = BlobMetadataRecord::from_document(map).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.filename, "img/logo.png");
        assert_eq!(record.extra.get("owner"), Some(&json!("ops")));
        assert!(!record.extra.contains_key("id"));

        let doc = record.to_document();
        assert_eq!(doc.get("_id"), Some(&json!(id.to_hex())));
        assert_eq!(doc.get("owner"), Some(&json!("ops")));
    }
}
