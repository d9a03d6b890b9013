//! In-process evaluation of filters, projections, update operators, sorts and
//! aggregation stages over JSON documents.
//!
//! Supports the subset the repository relies on:
//! - equality on dotted paths (array fields match when any element matches)
//! - `$eq $ne $gt $gte $lt $lte $in $nin $exists`, `$and $or $nor`
//! - inclusive or exclusive projections
//! - `$set $unset $inc $push`
//! - `$match $project $sort $skip $limit $count`

use serde_json::{Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

use crate::models::Document;

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    #[error("invalid operand for `{op}`: {reason}")]
    InvalidOperand { op: String, reason: String },
    #[error("projection cannot mix inclusion and exclusion")]
    MixedProjection,
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("invalid aggregation stage: {0}")]
    InvalidStage(String),
    #[error("invalid sort specification: {0}")]
    InvalidSort(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

fn invalid_operand(op: &str, reason: impl Into<String>) -> QueryError {
    QueryError::InvalidOperand {
        op: op.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> QueryResult<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
            Ok(())
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            match child {
                Value::Object(map) => set_path(map, rest, value),
                _ => Err(QueryError::InvalidUpdate(format!(
                    "cannot create field `{}` inside non-object `{}`",
                    rest, head
                ))),
            }
        }
    }
}

/// Remove a dotted path, returning the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.shift_remove(path),
        Some((head, rest)) => match doc.get_mut(head)? {
            Value::Object(map) => remove_path(map, rest),
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// Value ordering
// ---------------------------------------------------------------------------

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total ordering across JSON values: null < number < string < object < array < bool.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    compare_values(a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null))
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// True if `doc` satisfies every clause of `filter`.
pub fn matches(doc: &Document, filter: &Document) -> QueryResult<bool> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, cond)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => any_clause(doc, key, cond)?,
            "$nor" => !any_clause(doc, key, cond)?,
            op if op.starts_with('$') => return Err(QueryError::UnknownOperator(op.to_string())),
            path => field_matches(get_path(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, cond: &'a Value) -> QueryResult<Vec<&'a Document>> {
    let Value::Array(items) = cond else {
        return Err(invalid_operand(op, "expected an array of filters"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err(invalid_operand(op, "expected an array of filters")),
        })
        .collect()
}

fn any_clause(doc: &Document, op: &str, cond: &Value) -> QueryResult<bool> {
    for clause in clauses(op, cond)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(map: &Document) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn field_matches(value: Option<&Value>, cond: &Value) -> QueryResult<bool> {
    match cond {
        Value::Object(ops) if is_operator_object(ops) => {
            for (op, operand) in ops {
                if !apply_operator(value, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals_or_contains(value, cond)),
    }
}

fn equals_or_contains(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(v) => values_equal(v, expected),
    }
}

fn apply_operator(value: Option<&Value>, op: &str, operand: &Value) -> QueryResult<bool> {
    match op {
        "$eq" => Ok(equals_or_contains(value, operand)),
        "$ne" => Ok(!equals_or_contains(value, operand)),
        "$gt" | "$gte" | "$lt" | "$lte" => Ok(compare_operator(value, op, operand)),
        "$in" | "$nin" => {
            let Value::Array(candidates) = operand else {
                return Err(invalid_operand(op, "expected an array"));
            };
            let found = candidates
                .iter()
                .any(|candidate| equals_or_contains(value, candidate));
            Ok(if op == "$in" { found } else { !found })
        }
        "$exists" => Ok(value.is_some() == truthy(operand)),
        other => Err(QueryError::UnknownOperator(other.to_string())),
    }
}

fn compare_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    let Some(value) = value else {
        return false;
    };
    let check = |candidate: &Value| {
        if type_rank(candidate) != type_rank(operand) {
            return false;
        }
        let ord = compare_values(candidate, operand);
        match op {
            "$gt" => ord == Ordering::Greater,
            "$gte" => ord != Ordering::Less,
            "$lt" => ord == Ordering::Less,
            _ => ord != Ordering::Greater,
        }
    };
    match value {
        Value::Array(items) if !operand.is_array() => items.iter().any(check),
        other => check(other),
    }
}

/// Top-level `field: value` pairs of a filter, used to seed upserts.
pub fn equality_fields(filter: &Document) -> Document {
    filter
        .iter()
        .filter(|(key, value)| {
            !key.starts_with('$') && !matches!(value, Value::Object(map) if is_operator_object(map))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Apply an inclusion or exclusion projection. An empty projection is a no-op.
pub fn project(doc: &Document, projection: &Document) -> QueryResult<Document> {
    if projection.is_empty() {
        return Ok(doc.clone());
    }
    let include_id = projection.get("_id").map(truthy).unwrap_or(true);
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(key, _)| key.as_str() != "_id")
        .map(|(key, value)| (key, truthy(value)))
        .collect();

    let Some(&(_, inclusive)) = fields.first() else {
        let mut out = doc.clone();
        if !include_id {
            out.shift_remove("_id");
        }
        return Ok(out);
    };
    if fields.iter().any(|(_, flag)| *flag != inclusive) {
        return Err(QueryError::MixedProjection);
    }

    if inclusive {
        let mut out = Document::new();
        if include_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (path, _) in fields {
            if let Some(value) = get_path(doc, path) {
                set_path(&mut out, path, value.clone())?;
            }
        }
        Ok(out)
    } else {
        let mut out = doc.clone();
        for (path, _) in fields {
            remove_path(&mut out, path);
        }
        if !include_id {
            out.shift_remove("_id");
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Reject updates that are empty or contain plain fields.
pub fn ensure_operator_update(update: &Document) -> QueryResult<()> {
    if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
        return Err(QueryError::InvalidUpdate(
            "update document must only contain operators".into(),
        ));
    }
    Ok(())
}

/// Apply an operator update in place. Returns whether the document changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> QueryResult<bool> {
    ensure_operator_update(update)?;
    let before = doc.clone();
    for (op, fields) in update {
        let Value::Object(fields) = fields else {
            return Err(invalid_operand(op, "expected an object"));
        };
        for (path, value) in fields {
            if path == "_id" && doc.get("_id") != Some(value) {
                return Err(QueryError::InvalidUpdate("`_id` is immutable".into()));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$unset" => {
                    remove_path(doc, path);
                }
                "$inc" => {
                    let current = get_path(doc, path).cloned().unwrap_or(Value::from(0));
                    let sum = add_numbers(&current, value)
                        .ok_or_else(|| invalid_operand(op, format!("`{}` is not numeric", path)))?;
                    set_path(doc, path, sum)?;
                }
                "$push" => match get_path(doc, path).cloned() {
                    None => set_path(doc, path, Value::Array(vec![value.clone()]))?,
                    Some(Value::Array(mut items)) => {
                        items.push(value.clone());
                        set_path(doc, path, Value::Array(items))?;
                    }
                    Some(_) => {
                        return Err(invalid_operand(op, format!("`{}` is not an array", path)));
                    }
                },
                other => return Err(QueryError::UnknownOperator(other.to_string())),
            }
        }
    }
    Ok(*doc != before)
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return None;
    };
    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        return x.checked_add(y).map(Value::from);
    }
    Number::from_f64(x.as_f64()? + y.as_f64()?).map(Value::Number)
}

// ---------------------------------------------------------------------------
// Sorting and aggregation
// ---------------------------------------------------------------------------

fn sort_keys(sort: &Document) -> QueryResult<Vec<(&str, bool)>> {
    sort.iter()
        .map(|(path, dir)| match dir.as_i64() {
            Some(1) => Ok((path.as_str(), true)),
            Some(-1) => Ok((path.as_str(), false)),
            _ => Err(QueryError::InvalidSort(format!(
                "direction for `{}` must be 1 or -1",
                path
            ))),
        })
        .collect()
}

/// Stable multi-key sort. Missing fields sort as null.
pub fn sort_documents(docs: &mut [Document], sort: &Document) -> QueryResult<()> {
    let keys = sort_keys(sort)?;
    if keys.is_empty() {
        return Ok(());
    }
    docs.sort_by(|a, b| {
        for (path, ascending) in &keys {
            let ord = compare_optional(get_path(a, path), get_path(b, path));
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn stage_count(stage: &str, spec: &Value) -> QueryResult<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| QueryError::InvalidStage(format!("`{}` expects a non-negative integer", stage)))
}

/// Run an aggregation pipeline over `docs`.
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> QueryResult<Vec<Document>> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, spec)), None) = (entries.next(), entries.next()) else {
            return Err(QueryError::InvalidStage(
                "each stage must have exactly one key".into(),
            ));
        };
        docs = match name.as_str() {
            "$match" => {
                let Value::Object(filter) = spec else {
                    return Err(QueryError::InvalidStage("`$match` expects an object".into()));
                };
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches(&doc, filter)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let Value::Object(projection) = spec else {
                    return Err(QueryError::InvalidStage("`$project` expects an object".into()));
                };
                docs.iter()
                    .map(|doc| project(doc, projection))
                    .collect::<QueryResult<Vec<_>>>()?
            }
            "$sort" => {
                let Value::Object(sort) = spec else {
                    return Err(QueryError::InvalidStage("`$sort` expects an object".into()));
                };
                sort_documents(&mut docs, sort)?;
                docs
            }
            "$skip" => {
                let n = stage_count(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = stage_count(name, spec)?;
                docs.truncate(n);
                docs
            }
            "$count" => {
                let field = spec.as_str().filter(|f| !f.is_empty()).ok_or_else(|| {
                    QueryError::InvalidStage("`$count` expects a field name".into())
                })?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.to_string(), Value::from(docs.len() as u64));
                    vec![out]
                }
            }
            other => return Err(QueryError::InvalidStage(format!("unsupported stage `{}`", other))),
        };
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::doc;
    use serde_json::json;

    fn sample() -> Document {
        doc(json!({
            "_id": "a1",
            "name": "alpha",
            "score": 7,
            "tags": ["red", "blue"],
            "owner": { "email": "x@y.z", "age": 31 },
        }))
    }

    #[test]
    fn equality_and_dotted_paths() {
        let d = sample();
        assert!(matches(&d, &doc(json!({"name": "alpha"}))).unwrap());
        assert!(matches(&d, &doc(json!({"owner.email": "x@y.z"}))).unwrap());
        assert!(matches(&d, &doc(json!({"score": 7.0}))).unwrap());
        assert!(!matches(&d, &doc(json!({"name": "beta"}))).unwrap());
        assert!(matches(&d, &doc(json!({"missing": null}))).unwrap());
        assert!(matches(&d, &doc(json!({}))).unwrap());
    }

    #[test]
    fn array_fields_match_any_element() {
        let d = sample();
        assert!(matches(&d, &doc(json!({"tags": "blue"}))).unwrap());
        assert!(matches(&d, &doc(json!({"tags": ["red", "blue"]}))).unwrap());
        assert!(!matches(&d, &doc(json!({"tags": "green"}))).unwrap());
        assert!(matches(&d, &doc(json!({"tags.0": "red"}))).unwrap());
    }

    #[test]
    fn comparison_and_set_operators() {
        let d = sample();
        assert!(matches(&d, &doc(json!({"score": {"$gt": 5, "$lte": 7}}))).unwrap());
        assert!(!matches(&d, &doc(json!({"score": {"$lt": 7}}))).unwrap());
        assert!(!matches(&d, &doc(json!({"score": {"$gt": "5"}}))).unwrap());
        assert!(matches(&d, &doc(json!({"name": {"$in": ["beta", "alpha"]}}))).unwrap());
        assert!(matches(&d, &doc(json!({"name": {"$nin": ["beta"]}}))).unwrap());
        assert!(matches(&d, &doc(json!({"name": {"$ne": "beta"}}))).unwrap());
        assert!(matches(&d, &doc(json!({"owner": {"$exists": true}}))).unwrap());
        assert!(matches(&d, &doc(json!({"display_name": {"$exists": false}}))).unwrap());
    }

    #[test]
    fn logical_operators() {
        let d = sample();
        let or = doc(json!({"$or": [{"name": "beta"}, {"score": 7}]}));
        assert!(matches(&d, &or).unwrap());
        let and = doc(json!({"$and": [{"name": "alpha"}, {"score": 8}]}));
        assert!(!matches(&d, &and).unwrap());
        let nor = doc(json!({"$nor": [{"name": "beta"}]}));
        assert!(matches(&d, &nor).unwrap());
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let d = sample();
        assert_eq!(
            matches(&d, &doc(json!({"score": {"$near": 1}}))),
            Err(QueryError::UnknownOperator("$near".into()))
        );
        assert!(matches(&d, &doc(json!({"$where": "1"}))).is_err());
        assert!(matches(&d, &doc(json!({"name": {"$in": "alpha"}}))).is_err());
    }

    #[test]
    fn inclusive_projection_keeps_id_unless_excluded() {
        let d = sample();
        let p = project(&d, &doc(json!({"name": 1, "owner.email": 1}))).unwrap();
        assert_eq!(
            serde_json::Value::Object(p),
            json!({"_id": "a1", "name": "alpha", "owner": {"email": "x@y.z"}})
        );
        let p = project(&d, &doc(json!({"name": true, "_id": 0}))).unwrap();
        assert_eq!(serde_json::Value::Object(p), json!({"name": "alpha"}));
    }

    #[test]
    fn exclusive_projection_and_mixed_rejection() {
        let d = sample();
        let p = project(&d, &doc(json!({"tags": 0, "owner": 0}))).unwrap();
        assert!(!p.contains_key("tags"));
        assert!(p.contains_key("name"));
        assert_eq!(
            project(&d, &doc(json!({"tags": 0, "name": 1}))),
            Err(QueryError::MixedProjection)
        );
    }

    #[test]
    fn update_operators_merge_fields() {
        let mut d = sample();
        let changed = apply_update(
            &mut d,
            &doc(json!({
                "$set": {"owner.age": 32, "status": "ok"},
                "$inc": {"score": 3, "visits": 1},
                "$push": {"tags": "green"},
                "$unset": {"name": ""},
            })),
        )
        .unwrap();
        assert!(changed);
        assert_eq!(get_path(&d, "owner.age"), Some(&json!(32)));
        assert_eq!(get_path(&d, "owner.email"), Some(&json!("x@y.z")));
        assert_eq!(d.get("score"), Some(&json!(10)));
        assert_eq!(d.get("visits"), Some(&json!(1)));
        assert_eq!(d.get("tags"), Some(&json!(["red", "blue", "green"])));
        assert!(!d.contains_key("name"));
    }

    #[test]
    fn update_without_operators_or_changing_id_fails() {
        let mut d = sample();
        assert!(apply_update(&mut d, &doc(json!({"name": "x"}))).is_err());
        assert!(apply_update(&mut d, &doc(json!({"$set": {"_id": "other"}}))).is_err());
        assert!(!apply_update(&mut d, &doc(json!({"$set": {"name": "alpha"}}))).unwrap());
    }

    #[test]
    fn sorts_by_multiple_keys_with_missing_first() {
        let mut docs = vec![
            doc(json!({"k": 2, "n": "b"})),
            doc(json!({"k": 1, "n": "z"})),
            doc(json!({"n": "m"})),
            doc(json!({"k": 2, "n": "a"})),
        ];
        sort_documents(&mut docs, &doc(json!({"k": 1, "n": -1}))).unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d["n"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["m", "z", "b", "a"]);
        assert!(sort_documents(&mut docs, &doc(json!({"k": 2}))).is_err());
    }

    #[test]
    fn pipeline_stages_compose() {
        let docs: Vec<Document> = (0..10)
            .map(|i| doc(json!({"i": i, "even": i % 2 == 0})))
            .collect();
        let pipeline = vec![
            doc(json!({"$match": {"even": true}})),
            doc(json!({"$sort": {"i": -1}})),
            doc(json!({"$skip": 1})),
            doc(json!({"$limit": 2})),
            doc(json!({"$project": {"i": 1}})),
        ];
        let out = run_pipeline(docs.clone(), &pipeline).unwrap();
        assert_eq!(
            serde_json::Value::Array(out.into_iter().map(serde_json::Value::Object).collect()),
            json!([{"i": 6}, {"i": 4}])
        );

        let counted = run_pipeline(docs, &[doc(json!({"$count": "total"}))]).unwrap();
        assert_eq!(counted[0].get("total"), Some(&json!(10)));
        assert!(run_pipeline(Vec::new(), &[doc(json!({"$count": "total"}))]).unwrap().is_empty());
    }

    #[test]
    fn pipeline_rejects_unknown_stage() {
        let err = run_pipeline(Vec::new(), &[doc(json!({"$lookup": {}}))]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidStage(_)));
        let err = run_pipeline(Vec::new(), &[doc(json!({"$skip": 1, "$limit": 1}))]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidStage(_)));
    }

    #[test]
    fn equality_fields_skip_operators() {
        let filter = doc(json!({"name": "a", "score": {"$gt": 1}, "$or": []}));
        assert_eq!(serde_json::Value::Object(equality_fields(&filter)), json!({"name": "a"}));
    }
}
