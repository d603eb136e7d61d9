//! # Query Evaluation
//!
//! Filters, sorting and the aggregate pipeline, evaluated over JSON
//! documents. Every backend shares this code so query semantics do not
//! depend on where documents live.
//!
//! Filters use a map-of-conditions form:
//!
//! ```text
//! {"namespace": "dev", "labels.team": "red"}          equality, dotted paths
//! {"namespace": {"$in": ["", "dev"]}}                 operators
//! {"$or": [{"name": "a"}, {"name": "b"}]}             combinators
//! ```

use crate::types::{PorterError, Result};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// The primary key field of every document.
pub const ID_FIELD: &str = "_id";

/// A document filter in map-of-conditions form. The empty filter matches all.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter(pub Map<String, JsonValue>);

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from a JSON object; anything else is a validation error.
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            JsonValue::Null => Ok(Self::default()),
            other => Err(PorterError::Validation(format!(
                "a filter must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn by_id(id: &str) -> Self {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), JsonValue::String(id.to_string()));
        Self(map)
    }

    /// Add an equality condition.
    #[must_use]
    pub fn with(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn matches(&self, doc: &JsonValue) -> bool {
        self.0.iter().all(|(key, cond)| match key.as_str() {
            "$or" => sub_filters(cond).iter().any(|f| f.matches(doc)),
            "$and" => sub_filters(cond).iter().all(|f| f.matches(doc)),
            "$nor" => !sub_filters(cond).iter().any(|f| f.matches(doc)),
            path => matches_condition(lookup(doc, path), cond),
        })
    }
}

fn sub_filters(cond: &JsonValue) -> Vec<Filter> {
    match cond {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|i| i.as_object().map(|m| Filter(m.clone())))
            .collect(),
        _ => Vec::new(),
    }
}

/// Follow a dotted path into a document.
pub fn lookup<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_operator_object(cond: &JsonValue) -> bool {
    match cond {
        JsonValue::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(field: Option<&JsonValue>, cond: &JsonValue) -> bool {
    if !is_operator_object(cond) {
        return equals(field, cond);
    }
    let JsonValue::Object(ops) = cond else {
        return false;
    };
    ops.iter().all(|(op, arg)| match op.as_str() {
        "$eq" => equals(field, arg),
        "$ne" => !equals(field, arg),
        "$in" => arg
            .as_array()
            .is_some_and(|items| items.iter().any(|i| equals(field, i))),
        "$nin" => arg
            .as_array()
            .is_none_or(|items| !items.iter().any(|i| equals(field, i))),
        "$exists" => arg.as_bool().unwrap_or(true) == field.is_some(),
        "$gt" => compare_values(field, Some(arg)) == Ordering::Greater,
        "$gte" => compare_values(field, Some(arg)) != Ordering::Less,
        "$lt" => field.is_some() && compare_values(field, Some(arg)) == Ordering::Less,
        "$lte" => field.is_some() && compare_values(field, Some(arg)) != Ordering::Greater,
        _ => false,
    })
}

/// Equality with document-store semantics: a missing field equals null and an
/// array field matches when any element is equal.
fn equals(field: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match field {
        None => expected.is_null(),
        Some(JsonValue::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(value) => value == expected,
    }
}

fn type_rank(v: Option<&JsonValue>) -> u8 {
    match v {
        None => 0,
        Some(JsonValue::Null) => 1,
        Some(JsonValue::Bool(_)) => 2,
        Some(JsonValue::Number(_)) => 3,
        Some(JsonValue::String(_)) => 4,
        Some(JsonValue::Array(_)) => 5,
        Some(JsonValue::Object(_)) => 6,
    }
}

/// Total order over optional JSON values used by sorting and range operators.
pub fn compare_values(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (Some(JsonValue::Bool(x)), Some(JsonValue::Bool(y))) => x.cmp(y),
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(i), Some(j)) => i.cmp(&j),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (Some(JsonValue::Array(x)), Some(JsonValue::Array(y))) => {
            for (i, j) in x.iter().zip(y.iter()) {
                let ord = compare_values(Some(i), Some(j));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Some(x @ JsonValue::Object(_)), Some(y @ JsonValue::Object(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

// =============================================================================
// SORT
// =============================================================================

/// Sort keys; a leading `-` sorts that field descending.
pub fn sort_documents(docs: &mut [JsonValue], sort: &[String]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for key in sort {
            let (field, descending) = match key.strip_prefix('-') {
                Some(f) => (f, true),
                None => (key.as_str(), false),
            };
            let mut ord = compare_values(lookup(a, field), lookup(b, field));
            if descending {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

// =============================================================================
// FIND
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOptions {
    pub filter: Filter,
    pub sort: Vec<String>,
    pub skip: usize,
    /// Zero means unlimited.
    pub limit: usize,
}

impl FindOptions {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sorted(mut self, sort: &[&str]) -> Self {
        self.sort = sort.iter().map(|s| (*s).to_string()).collect();
        self
    }

    #[must_use]
    pub fn page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }
}

/// Filter, sort and page a collection scan. Documents without a sort key keep
/// their primary-key order.
pub fn apply_find(mut docs: Vec<JsonValue>, opts: &FindOptions) -> Vec<JsonValue> {
    docs.retain(|d| opts.filter.matches(d));
    sort_documents(&mut docs, &opts.sort);
    let iter = docs.into_iter().skip(opts.skip);
    if opts.limit == 0 {
        iter.collect()
    } else {
        iter.take(opts.limit).collect()
    }
}

// =============================================================================
// AGGREGATE
// =============================================================================

/// One stage of an aggregate pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<String>),
    /// Group by the field and keep the first document of each group.
    GroupFirst(String),
    Limit(usize),
}

pub fn run_pipeline(mut docs: Vec<JsonValue>, pipeline: &[Stage]) -> Vec<JsonValue> {
    for stage in pipeline {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Sort(keys) => {
                sort_documents(&mut docs, keys);
                docs
            }
            Stage::GroupFirst(field) => {
                let mut seen = BTreeSet::new();
                docs.into_iter()
                    .filter(|d| {
                        let key = lookup(d, field)
                            .map(JsonValue::to_string)
                            .unwrap_or_default();
                        seen.insert(key)
                    })
                    .collect()
            }
            Stage::Limit(n) => docs.into_iter().take(*n).collect(),
        };
    }
    docs
}

// =============================================================================
// INDEXES
// =============================================================================

/// An index over one collection. Keys prefixed `-` are descending.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Index {
    pub keys: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            keys: keys.iter().map(|k| (*k).to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(keys: &[&str]) -> Self {
        Self {
            unique: true,
            ..Self::new(keys)
        }
    }

    fn key_of(&self, doc: &JsonValue) -> Vec<JsonValue> {
        self.keys
            .iter()
            .map(|k| {
                let field = k.trim_start_matches('-');
                lookup(doc, field).cloned().unwrap_or(JsonValue::Null)
            })
            .collect()
    }
}

/// Reject `doc` when it collides with another document on a unique index.
pub fn check_unique<'a>(
    collection: &str,
    indexes: &[Index],
    existing: impl Iterator<Item = &'a JsonValue> + Clone,
    doc: &JsonValue,
) -> Result<()> {
    let id = lookup(doc, ID_FIELD);
    for index in indexes.iter().filter(|i| i.unique) {
        let key = index.key_of(doc);
        let clash = existing
            .clone()
            .any(|other| lookup(other, ID_FIELD) != id && index.key_of(other) == key);
        if clash {
            return Err(PorterError::Storage(format!(
                "duplicate key in {collection} for index ({}): {}",
                index.keys.join(", "),
                JsonValue::Array(key)
            )));
        }
    }
    Ok(())
}

/// The `_id` of a document, required for every write.
pub fn document_id(doc: &JsonValue) -> Result<String> {
    match lookup(doc, ID_FIELD) {
        Some(JsonValue::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(PorterError::Storage(format!(
            "document is missing a string {ID_FIELD}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<JsonValue> {
        vec![
            json!({"_id": "1", "namespace": "", "name": "a", "labels": {"team": "red"}}),
            json!({"_id": "2", "namespace": "dev", "name": "b", "labels": {"team": "blue"}}),
            json!({"_id": "3", "namespace": "dev", "name": "c", "tags": ["x", "y"]}),
        ]
    }

    #[test]
    fn equality_and_paths() {
        let f = Filter::all().with("labels.team", "red");
        let out = apply_find(docs(), &FindOptions::new(f));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["_id"], "1");
    }

    #[test]
    fn operators() {
        let f = Filter::from_json(json!({"namespace": {"$in": ["", "dev"]}, "name": {"$ne": "b"}}))
            .expect("filter");
        let out = apply_find(docs(), &FindOptions::new(f));
        assert_eq!(out.len(), 2);

        let f = Filter::from_json(json!({"labels": {"$exists": false}})).expect("filter");
        assert_eq!(apply_find(docs(), &FindOptions::new(f)).len(), 1);

        let f = Filter::from_json(json!({"tags": "y"})).expect("filter");
        assert_eq!(apply_find(docs(), &FindOptions::new(f)).len(), 1);
    }

    #[test]
    fn or_combinator() {
        let f = Filter::from_json(json!({"$or": [{"name": "a"}, {"name": "c"}]})).expect("filter");
        assert_eq!(apply_find(docs(), &FindOptions::new(f)).len(), 2);
    }

    #[test]
    fn sort_skip_limit() {
        let opts = FindOptions::new(Filter::all())
            .sorted(&["-namespace", "name"])
            .page(1, 1);
        let out = apply_find(docs(), &opts);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["name"], "c");
    }

    #[test]
    fn group_first_keeps_latest() {
        let outputs = vec![
            json!({"_id": "r1-a", "name": "a", "resultId": "r1"}),
            json!({"_id": "r2-a", "name": "a", "resultId": "r2"}),
            json!({"_id": "r1-b", "name": "b", "resultId": "r1"}),
        ];
        let out = run_pipeline(
            outputs,
            &[
                Stage::Sort(vec!["name".into(), "-resultId".into()]),
                Stage::GroupFirst("name".into()),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], "r2-a");
        assert_eq!(out[1]["_id"], "r1-b");
    }

    #[test]
    fn unique_index_clash() {
        let existing = docs();
        let index = Index::unique(&["namespace", "name"]);
        let dup = json!({"_id": "9", "namespace": "dev", "name": "b"});
        assert!(check_unique("installations", &[index.clone()], existing.iter(), &dup).is_err());
        let same = json!({"_id": "2", "namespace": "dev", "name": "b"});
        assert!(check_unique("installations", &[index], existing.iter(), &same).is_ok());
    }
}
