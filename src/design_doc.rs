//! Design Document Reconciler (C7): merges code-declared view/filter/show/
//! list/update-handler definitions with whatever is currently stored under a
//! design document id.
//!
//! The merge itself (`merge`) is a pure function — it never touches the
//! network and never mutates its inputs by reference, only returning a new
//! merged value — so the GET/PUT orchestration around it can be tested
//! independently of the merge rules.
use std::collections::BTreeMap;

use reqwest::Method;
use serde_json::{Map, Value};

use crate::error::CouchError;
use crate::request::RequestBuilder;
use crate::response_gate::{gate, Gated, NotFoundPolicy};

/// One `{map, reduce?}` (or filter/show/list/update-handler source) entry, as
/// produced from a declaration after `classpath:`/`file` references have
/// already been resolved by the caller's resource provider.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSource {
    pub map: String,
    pub reduce: Option<String>,
}

impl FunctionSource {
    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("map".into(), Value::String(self.map.clone()));
        if let Some(reduce) = &self.reduce {
            obj.insert("reduce".into(), Value::String(reduce.clone()));
        }
        Value::Object(obj)
    }
}

/// The categories a design document reconciles, independently of each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesignDocDeclarations {
    pub views: BTreeMap<String, FunctionSource>,
    pub filters: BTreeMap<String, String>,
    pub shows: BTreeMap<String, String>,
    pub lists: BTreeMap<String, String>,
    pub update_handlers: BTreeMap<String, String>,
}

impl DesignDocDeclarations {
    pub fn to_candidate(&self, language: &str) -> Value {
        let mut doc = Map::new();
        doc.insert("language".into(), Value::String(language.to_string()));
        if !self.views.is_empty() {
            doc.insert("views".into(), map_to_object(&self.views, FunctionSource::to_value));
        }
        if !self.filters.is_empty() {
            doc.insert("filters".into(), map_to_object(&self.filters, |s| Value::String(s.clone())));
        }
        if !self.shows.is_empty() {
            doc.insert("shows".into(), map_to_object(&self.shows, |s| Value::String(s.clone())));
        }
        if !self.lists.is_empty() {
            doc.insert("lists".into(), map_to_object(&self.lists, |s| Value::String(s.clone())));
        }
        if !self.update_handlers.is_empty() {
            doc.insert("updates".into(), map_to_object(&self.update_handlers, |s| Value::String(s.clone())));
        }
        Value::Object(doc)
    }
}

fn map_to_object<V>(map: &BTreeMap<String, V>, to_value: impl Fn(&V) -> Value) -> Value {
    let mut obj = Map::new();
    for (name, entry) in map {
        obj.insert(name.clone(), to_value(entry));
    }
    Value::Object(obj)
}

/// One Mango index view: a field list plus an optional partial selector,
/// shaped the way a Mango index design document stores it rather than the
/// `{map, reduce}` shape ordinary views use.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MangoIndexSpec {
    pub fields: Vec<String>,
    pub partial_filter_selector: Option<Value>,
}

impl MangoIndexSpec {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("fields".into(), Value::Array(self.fields.iter().cloned().map(Value::String).collect()));
        if let Some(selector) = &self.partial_filter_selector {
            map.insert("partial_filter_selector".into(), selector.clone());
        }
        let mut view = Map::new();
        view.insert("map".into(), Value::Object(map));
        Value::Object(view)
    }
}

/// Id a Mango index design document is stored under for a given document
/// type, per spec.md §4.7 ("Mango index design docs" are stored separately
/// from ordinary ones).
pub fn mango_design_doc_id(doc_type: &str) -> String {
    format!("_design/{doc_type}_mango")
}

fn mango_candidate(views: &BTreeMap<String, MangoIndexSpec>) -> Value {
    let mut doc = Map::new();
    doc.insert("language".into(), Value::String("query".into()));
    doc.insert("views".into(), map_to_object(views, MangoIndexSpec::to_value));
    Value::Object(doc)
}

const CATEGORIES: &[&str] = &["views", "filters", "shows", "lists", "updates"];

/// Merge `candidate` into `stored` per category, per spec.md §4.7:
/// - a candidate entry absent from `stored` is added;
/// - a candidate entry present in `stored` is overwritten only if `force` is
///   true and the two differ;
/// - entries in `stored` absent from `candidate` are always kept.
///
/// Returns the merged document and whether anything actually changed, so the
/// caller can skip the PUT entirely when the merge is a no-op.
pub fn merge(stored: &Value, candidate: &Value, force: bool) -> (Value, bool) {
    let mut merged = stored.clone();
    let mut changed = false;

    let merged_obj = merged.as_object_mut().expect("design document must be a JSON object");
    let candidate_obj = candidate.as_object();

    for category in CATEGORIES {
        let candidate_entries = candidate_obj.and_then(|c| c.get(*category)).and_then(Value::as_object);
        let candidate_entries = match candidate_entries {
            Some(entries) => entries,
            None => continue,
        };

        let stored_category = merged_obj
            .entry(category.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let stored_category = stored_category.as_object_mut().expect("category must be an object");

        for (name, candidate_value) in candidate_entries {
            match stored_category.get(name) {
                None => {
                    stored_category.insert(name.clone(), candidate_value.clone());
                    changed = true;
                }
                Some(existing) if force && existing != candidate_value => {
                    stored_category.insert(name.clone(), candidate_value.clone());
                    changed = true;
                }
                Some(_) => {}
            }
        }
    }

    (merged, changed)
}

/// GET/PUT orchestration around [`merge`]. `language` is `"javascript"` for
/// ordinary design documents.
pub async fn reconcile(
    requests: &RequestBuilder,
    db: &str,
    design_doc_id: &str,
    declarations: &DesignDocDeclarations,
    language: &str,
    force_update: bool,
    update_if_exists: bool,
) -> Result<ReconcileOutcome, CouchError> {
    let candidate = declarations.to_candidate(language);
    reconcile_candidate(requests, db, design_doc_id, &candidate, force_update, update_if_exists).await
}

/// Same orchestration as [`reconcile`], but for a Mango index design
/// document: stored under [`mango_design_doc_id`] with `language: "query"`
/// and a field-map/partial-selector view shape instead of `{map, reduce}`
/// (spec.md §4.7, "Mango index design docs"). Merged per view name on the
/// same `views` category `reconcile` uses.
pub async fn reconcile_mango(
    requests: &RequestBuilder,
    db: &str,
    doc_type: &str,
    views: &BTreeMap<String, MangoIndexSpec>,
    force_update: bool,
    update_if_exists: bool,
) -> Result<ReconcileOutcome, CouchError> {
    let design_doc_id = mango_design_doc_id(doc_type);
    let candidate = mango_candidate(views);
    reconcile_candidate(requests, db, &design_doc_id, &candidate, force_update, update_if_exists).await
}

async fn reconcile_candidate(
    requests: &RequestBuilder,
    db: &str,
    design_doc_id: &str,
    candidate: &Value,
    force_update: bool,
    update_if_exists: bool,
) -> Result<ReconcileOutcome, CouchError> {
    let get_req = requests.request(Method::GET, &[db, design_doc_id], &[]);
    let response = get_req.into_inner().send().await?;
    let gated = gate(response, NotFoundPolicy::NullIfAbsent, requests.dispatch()).await?;

    let stored = match gated {
        Gated::Absent => None,
        Gated::Body { bytes_stream } => {
            let bytes = collect_bytes(bytes_stream).await?;
            Some(serde_json::from_slice::<Value>(&bytes)?)
        }
    };

    let stored = match stored {
        None => {
            put(requests, db, design_doc_id, candidate, None).await?;
            return Ok(ReconcileOutcome::Created);
        }
        Some(doc) => doc,
    };

    if !update_if_exists {
        return Ok(ReconcileOutcome::LeftUnchanged);
    }

    let (merged, changed) = merge(&stored, candidate, force_update);
    if !changed {
        return Ok(ReconcileOutcome::LeftUnchanged);
    }

    let rev = stored.get("_rev").and_then(Value::as_str).map(str::to_string);
    put(requests, db, design_doc_id, &merged, rev.as_deref()).await?;
    Ok(ReconcileOutcome::Updated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    LeftUnchanged,
}

async fn put(
    requests: &RequestBuilder,
    db: &str,
    design_doc_id: &str,
    body: &Value,
    rev: Option<&str>,
) -> Result<(), CouchError> {
    let mut body = body.clone();
    if let Some(rev) = rev {
        body.as_object_mut()
            .expect("design document must be a JSON object")
            .insert("_rev".into(), Value::String(rev.to_string()));
    }
    let req = requests.request(Method::PUT, &[db, design_doc_id], &[]).json(&body);
    let response = req.into_inner().send().await?;
    gate(response, NotFoundPolicy::Fail, requests.dispatch()).await?;
    Ok(())
}

async fn collect_bytes(
    mut bytes_stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
) -> Result<Vec<u8>, CouchError> {
    use futures_util::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = bytes_stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_missing_entries_without_force() {
        let stored = serde_json::json!({"_id": "_design/foo", "views": {"a": {"map": "old"}}});
        let candidate = serde_json::json!({"language": "javascript", "views": {"b": {"map": "new"}}});
        let (merged, changed) = merge(&stored, &candidate, false);
        assert!(changed);
        assert_eq!(merged["views"]["a"]["map"], "old");
        assert_eq!(merged["views"]["b"]["map"], "new");
    }

    #[test]
    fn keeps_stored_entry_without_force_even_if_candidate_differs() {
        let stored = serde_json::json!({"views": {"a": {"map": "old"}}});
        let candidate = serde_json::json!({"views": {"a": {"map": "new"}}});
        let (merged, changed) = merge(&stored, &candidate, false);
        assert!(!changed);
        assert_eq!(merged["views"]["a"]["map"], "old");
    }

    #[test]
    fn overwrites_with_force_when_differing() {
        let stored = serde_json::json!({"views": {"a": {"map": "old"}}});
        let candidate = serde_json::json!({"views": {"a": {"map": "new"}}});
        let (merged, changed) = merge(&stored, &candidate, true);
        assert!(changed);
        assert_eq!(merged["views"]["a"]["map"], "new");
    }

    #[test]
    fn identical_candidate_under_force_is_not_a_change() {
        let stored = serde_json::json!({"views": {"a": {"map": "same"}}});
        let candidate = serde_json::json!({"views": {"a": {"map": "same"}}});
        let (_, changed) = merge(&stored, &candidate, true);
        assert!(!changed);
    }

    #[test]
    fn merge_is_idempotent() {
        let stored = serde_json::json!({"views": {"a": {"map": "old"}}});
        let candidate = serde_json::json!({"views": {"b": {"map": "new"}}});
        let (once, _) = merge(&stored, &candidate, false);
        let (twice, changed_again) = merge(&once, &candidate, false);
        assert_eq!(once, twice);
        assert!(!changed_again);
    }

    #[test]
    fn mango_design_doc_id_is_type_scoped() {
        assert_eq!(mango_design_doc_id("user"), "_design/user_mango");
    }

    #[test]
    fn mango_candidate_uses_query_language_and_field_map_shape() {
        let mut views = BTreeMap::new();
        views.insert(
            "by_email".to_string(),
            MangoIndexSpec {
                fields: vec!["email".to_string()],
                partial_filter_selector: Some(serde_json::json!({"active": true})),
            },
        );
        let candidate = mango_candidate(&views);
        assert_eq!(candidate["language"], "query");
        assert_eq!(candidate["views"]["by_email"]["map"]["fields"], serde_json::json!(["email"]));
        assert_eq!(candidate["views"]["by_email"]["map"]["partial_filter_selector"], serde_json::json!({"active": true}));
    }

    #[test]
    fn mango_candidate_merges_against_stored_views_like_ordinary_ones() {
        let mut views = BTreeMap::new();
        views.insert("by_email".to_string(), MangoIndexSpec { fields: vec!["email".to_string()], partial_filter_selector: None });
        let candidate = mango_candidate(&views);
        let stored = serde_json::json!({"language": "query", "views": {"by_name": {"map": {"fields": ["name"]}}}});
        let (merged, changed) = merge(&stored, &candidate, false);
        assert!(changed);
        assert_eq!(merged["views"]["by_name"]["map"]["fields"], serde_json::json!(["name"]));
        assert_eq!(merged["views"]["by_email"]["map"]["fields"], serde_json::json!(["email"]));
    }
}
