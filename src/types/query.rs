use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A `_find` selector query, built up with the same chained-setter style the
/// rest of this crate's request types use.
///
/// ```
/// # use couch_reactive::types::MangoQuery;
/// let query = MangoQuery::new()
///     .selector(serde_json::json!({ "year": { "$eq": 2001 } }))
///     .fields(vec!["year", "title"])
///     .limit(10);
/// ```
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct MangoQuery {
    /// A JSON object describing documents of interest. Within this
    /// structure conditional logic is expressed with specially named
    /// fields (`$eq`, `$gt`, `$and`, ...).
    selector: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<Vec<SortType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    use_index: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflicts: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    r: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bookmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_stats: Option<bool>,
}

impl MangoQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selector(mut self, selector: Value) -> Self {
        self.selector = selector;
        self
    }

    pub fn sort(mut self, values: Vec<SortType>) -> Self {
        self.sort = Some(values);
        self
    }

    pub fn fields(mut self, values: Vec<&str>) -> Self {
        self.fields = Some(values.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn limit(mut self, max_docs: i64) -> Self {
        self.limit = Some(max_docs);
        self
    }

    pub fn skip(mut self, docs_to_skip: i64) -> Self {
        self.skip = Some(docs_to_skip);
        self
    }

    pub fn use_index(mut self, index_to_use: Vec<String>) -> Self {
        self.use_index = Some(index_to_use);
        self
    }

    /// Include conflicted documents. Default `false`.
    pub fn conflicts(mut self, enable: bool) -> Self {
        self.conflicts = Some(enable);
        self
    }

    /// Read quorum; defaults to 1 server-side.
    pub fn r(mut self, quorum: i64) -> Self {
        self.r = Some(quorum);
        self
    }

    pub fn bookmark(mut self, value: String) -> Self {
        self.bookmark = Some(value);
        self
    }

    /// Whether to update the index before returning results. Default `true`.
    pub fn update(mut self, enable: bool) -> Self {
        self.update = Some(enable);
        self
    }

    pub fn stable(mut self, enable: bool) -> Self {
        self.stable = Some(enable);
        self
    }

    pub fn execution_stats(mut self, enable: bool) -> Self {
        self.execution_stats = Some(enable);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum SortType {
    String(String),
    Json(Value),
}

impl Default for SortType {
    fn default() -> Self {
        Self::String(String::default())
    }
}
