use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Save documents in bulk via `_bulk_docs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkDocs<T>
where
    T: Serialize,
{
    /// List of document objects.
    docs: Vec<T>,
    /// If `false`, prevents the database from assigning new revision IDs.
    /// Default is `true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    new_edits: Option<bool>,
    /// CouchDB's historical all-or-nothing write mode. Deprecated upstream
    /// and exposed on no builder method here, but kept on the wire struct
    /// so a caller deserializing a hand-built request body doesn't lose it.
    #[serde(skip_serializing_if = "Option::is_none")]
    all_or_nothing: Option<bool>,
}

impl<T> Default for BulkDocs<T>
where
    T: Serialize,
{
    fn default() -> Self {
        Self {
            docs: vec![],
            new_edits: None,
            all_or_nothing: None,
        }
    }
}

impl<T> BulkDocs<T>
where
    T: Serialize,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn docs(mut self, docs: Vec<T>) -> Self {
        self.docs = docs;
        self
    }

    /// If `false`, prevents the database from assigning new revision IDs.
    pub fn new_edits(mut self, enable: bool) -> Self {
        self.new_edits = Some(enable);
        self
    }
}

/// One entry of a `_bulk_docs` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkDocsRes {
    pub ok: Option<bool>,
    pub id: String,
    /// Present if the document saved without errors.
    pub rev: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkDocsResponse(pub Vec<BulkDocsRes>);

/// One id to fetch via `_bulk_get`, optionally pinned to a revision.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkDocQuery {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rev: Option<String>,
}

impl BulkDocQuery {
    pub fn new<A: Into<String>>(id: A) -> Self {
        Self { id: id.into(), rev: None }
    }

    pub fn new_with_rev<A: Into<String>, B: Into<String>>(id: A, rev: B) -> Self {
        Self { id: id.into(), rev: Some(rev.into()) }
    }

    pub fn rev<A: Into<String>>(mut self, rev: A) -> Self {
        self.rev = Some(rev.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkData<T>
where
    T: Serialize,
{
    docs: Vec<T>,
}

impl<T> Default for BulkData<T>
where
    T: Serialize,
{
    fn default() -> Self {
        Self { docs: vec![] }
    }
}

impl<T> BulkData<T>
where
    T: Serialize,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn docs(mut self, docs: Vec<T>) -> Self {
        self.docs = docs;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkGetResponse {
    pub results: Vec<BulkGetObj>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkGetObj {
    pub id: String,
    pub docs: Vec<BulkResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkResult {
    pub ok: Option<Value>,
    pub error: Option<ErrorBulkResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBulkResponse {
    pub id: String,
    pub rev: String,
    pub error: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bulk_docs_omits_new_edits_and_all_or_nothing_unless_set() {
        let bulk = BulkDocs::<Value>::new().docs(vec![json!({"a": 1})]);
        let value = serde_json::to_value(&bulk).unwrap();
        assert_eq!(value, json!({ "docs": [{"a": 1}] }));
    }

    #[test]
    fn bulk_doc_query_serializes_rev_only_when_present() {
        let without_rev = serde_json::to_value(BulkDocQuery::new("doc-1")).unwrap();
        assert_eq!(without_rev, json!({ "id": "doc-1" }));

        let with_rev = serde_json::to_value(BulkDocQuery::new_with_rev("doc-1", "1-abc")).unwrap();
        assert_eq!(with_rev, json!({ "id": "doc-1", "rev": "1-abc" }));
    }
}
