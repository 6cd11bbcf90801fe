use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
pub struct Index {
    /// JSON object describing the index to create.
    index: IndexData,
    /// Design document to create the index in. By default, each index gets
    /// its own design document.
    #[serde(skip_serializing_if = "Option::is_none")]
    ddoc: Option<String>,
    /// Name of the index. Auto-generated if omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    index_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    partitioned: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum IndexType {
    Text,
    Json,
}

impl Default for IndexType {
    fn default() -> Self {
        Self::Json
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            IndexType::Text => write!(f, "text"),
            IndexType::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexData {
    /// Selector to apply to documents at indexing time, creating a partial index.
    #[serde(skip_serializing_if = "Option::is_none")]
    partial_filter_selector: Option<Value>,
    /// Field names following the sort syntax; nested fields use dot notation.
    fields: Vec<String>,
}

impl Default for IndexData {
    fn default() -> Self {
        Self { partial_filter_selector: None, fields: vec![] }
    }
}

impl IndexData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partial_filter_selector(mut self, value: Value) -> Self {
        self.partial_filter_selector = Some(value);
        self
    }

    pub fn fields(mut self, fields: Vec<&str>) -> Self {
        self.fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl Default for Index {
    fn default() -> Self {
        Self {
            index: IndexData::default(),
            ddoc: None,
            name: None,
            index_type: IndexType::Json.to_string(),
            partitioned: None,
        }
    }
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_index(mut self, index: IndexData) -> Self {
        self.index = index;
        self
    }

    pub fn design_doc_index<A: Into<String>>(mut self, ddoc: A) -> Self {
        self.ddoc = Some(ddoc.into());
        self
    }

    pub fn name<A: Into<String>>(mut self, index_name: A) -> Self {
        self.name = Some(index_name.into());
        self
    }

    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type.to_string();
        self
    }

    pub fn partitioned(mut self, enable: bool) -> Self {
        self.partitioned = Some(enable);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexResponse {
    /// `created` or `exists`.
    pub result: String,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetIndexResponse {
    pub total_rows: i64,
    pub indexes: Vec<IndexObj>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexObj {
    pub ddoc: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub index_type: String,
    pub def: IndexFields,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexFields {
    fields: Vec<Value>,
}
