//! Reactive client for document-oriented, HTTP/JSON databases: streaming
//! views, change feeds, Mango queries and design-document reconciliation on
//! top of `reqwest` + `serde_json` + `async-stream`.
//!
//! [`Client`] owns node-level operations (database lifecycle, the
//! replicator); [`DBInUse`] is returned from [`Client::connect_to_db`] and
//! owns everything scoped to one database.
use bevy_reflect::Reflect;
#[cfg(feature = "color")]
pub use colored_json;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod bulk;
mod changes;
mod db;
mod design_doc;
mod error;
mod mango;
mod pagination;
mod replicator;
mod request;
mod response_gate;
mod token;
pub mod types;
mod view;

pub use bulk::BulkUpdateResult;
pub use changes::{BackoffConfig, Change, DocResolver};
pub use db::DBInUse;
pub use design_doc::{mango_design_doc_id, DesignDocDeclarations, FunctionSource, MangoIndexSpec, ReconcileOutcome};
pub use error::{CouchDBError, CouchError};
pub use mango::MangoQueryResult;
pub use replicator::{CancelResult, ReplicateResult, SchedulerEntry, SchedulerState, StateFlags};
pub use response_gate::HeaderDispatch;
pub use view::{DocSlot, ViewEvent, ViewQuery, ViewRow, ViewTarget};

use request::RequestBuilder;

pub trait Convert {
    /// Convert to string and indent
    fn to_string_pretty(&self) -> Result<String, CouchError>
    where
        Self: Serialize,
    {
        let u = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&u)?)
    }
    /// Convert to string
    fn to_string(&self) -> Result<String, CouchError>
    where
        Self: Serialize,
    {
        let u = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&u)?)
    }
    /// Convert to json value
    fn to_json(&self) -> Result<Value, CouchError>
    where
        Self: Serialize,
    {
        Ok(serde_json::to_value(self)?)
    }
    /// Convert to string, indent and color it
    #[cfg(feature = "color")]
    fn to_colored_string(&self) -> Result<String, CouchError>
    where
        Self: Serialize,
    {
        let u = serde_json::to_value(self)?;
        Ok(colored_json::to_colored_json_auto(&u)?)
    }
}

impl Convert for CouchDBInfo {}
impl Convert for CouchDBListDBs {}

pub trait ParseQueryParams: bevy_reflect::Struct {
    /// Parse Struct keys and values into a HTTP query string
    fn parse_params(&self) -> String {
        let mut params = "".to_string();
        for (index, value) in self.iter_fields().enumerate() {
            let field_name = self.name_at(index).unwrap();
            let value_formatted = self.get_value(value);
            if !value_formatted.eq("false") && !value_formatted.is_empty() && !value_formatted.eq("0") {
                params.push_str(&format!("{}={}&", field_name, value_formatted));
            }
        }
        params
    }
    /// Based on value type get the actual value as a String
    fn get_value(&self, value: &dyn Reflect) -> String {
        match value.type_name() {
            "bool" => value.downcast_ref::<bool>().unwrap().to_string(),
            "i64" => value.downcast_ref::<i64>().unwrap().to_string(),
            "alloc::string::String" => value.downcast_ref::<String>().unwrap().to_owned(),
            _ => "".to_string(),
        }
    }
}

/// List of every database present on a node.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CouchDBListDBs {
    pub db_list: Vec<String>,
}

/// Node information, as returned by `GET /`.
/// ```text
///    {
///         "couchdb": "Welcome",
///         "features": ["access-ready", "partitioned", "scheduler"],
///         "git_sha": "572b68e72",
///         "uuid": "7ecbe8fcc2cde610fe02ee82df51cbf7",
///         "vendor": { "name": "The Apache Software Foundation" },
///         "version": "3.1.2"
///    }
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CouchDBInfo {
    pub couchdb: String,
    pub version: String,
    pub git_sha: String,
    pub uuid: String,
    pub features: Vec<String>,
    pub vendor: Vendor,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Vendor {
    pub name: String,
}

/// Confirmation body returned by `PUT`/`DELETE` against a database.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DBOperationSuccess {
    pub ok: bool,
}

/// One task entry under `GET /_active_tasks`. The server's polymorphic task
/// hierarchy collapses to one shape here: every task kind shares the
/// `{pid, started_on, updated_on}` prefix, with `kind`-specific fields left
/// in `details` rather than modeled per-variant.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ActiveTask {
    pub pid: String,
    pub started_on: i64,
    pub updated_on: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub details: Value,
}

/// Security document governing a database's admin/member access lists.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SecurityDoc {
    #[serde(default)]
    pub admins: SecurityGroup,
    #[serde(default)]
    pub members: SecurityGroup,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SecurityGroup {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Entry point: a connection to one node, authenticated once and shared
/// (cheaply cloned) by every [`DBInUse`] it hands out.
#[derive(Debug, Clone)]
pub struct Client {
    requests: RequestBuilder,
}

impl Client {
    /// Connect to a node with no authentication.
    /// # Example
    /// ```no_run
    /// let client = couch_reactive::Client::new("http://localhost:5984");
    /// ```
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            requests: RequestBuilder::new(reqwest::Client::new(), url),
        }
    }

    /// Connect with HTTP Basic credentials attached to every request.
    pub fn with_auth(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            requests: RequestBuilder::new(reqwest::Client::new(), url).with_auth(username, password),
        }
    }

    /// Tag every outgoing request with a correlation id header, surfaced to
    /// the server for request tracing.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.requests = self.requests.with_correlation_id(id);
        self
    }

    /// Node information (`GET /`).
    pub async fn get_node_info(&self) -> Result<CouchDBInfo, CouchError> {
        let response = self.requests.request(Method::GET, &[], &[]).into_inner().send().await?;
        let bytes = collect_body(response, self.requests.dispatch()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List all databases present on the node (`GET /_all_dbs`).
    pub async fn all_dbs(&self) -> Result<CouchDBListDBs, CouchError> {
        let response = self.requests.request(Method::GET, &["_all_dbs"], &[]).into_inner().send().await?;
        let bytes = collect_body(response, self.requests.dispatch()).await?;
        let db_list: Vec<String> = serde_json::from_slice(&bytes)?;
        Ok(CouchDBListDBs { db_list })
    }

    /// Whether a database exists (`GET <db>`, treating 404 as `false` rather
    /// than an error).
    pub async fn exists(&self, db_name: &str) -> Result<bool, CouchError> {
        use response_gate::{gate, Gated, NotFoundPolicy};
        let response = self.requests.request(Method::GET, &[db_name], &[]).into_inner().send().await?;
        match gate(response, NotFoundPolicy::NullIfAbsent, self.requests.dispatch()).await? {
            Gated::Absent => Ok(false),
            Gated::Body { .. } => Ok(true),
        }
    }

    /// Create a database. `shards`/`replicas` map to the server's `q`/`n`
    /// cluster-placement parameters and are left unset (server defaults)
    /// when `None`.
    ///
    /// The database name **must** be composed by following next rules:
    /// - Name **must** begin with a lowercase letter `(a-z)`
    /// - Lowercase characters `(a-z)`
    /// - Digits `(0-9)`
    /// - Any of the characters `_, $, (, ), +, -,` and `/`.
    pub async fn create_db(&self, db_name: &str, shards: Option<i64>, replicas: Option<i64>) -> Result<DBOperationSuccess, CouchError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(q) = shards {
            query.push(("q", q.to_string()));
        }
        if let Some(n) = replicas {
            query.push(("n", n.to_string()));
        }
        let response = self.requests.request(Method::PUT, &[db_name], &query).into_inner().send().await?;
        let bytes = collect_body(response, self.requests.dispatch()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Deletes the specified database, and all the documents and
    /// attachments contained within it.
    pub async fn delete_db(&self, db_name: &str) -> Result<DBOperationSuccess, CouchError> {
        let response = self.requests.request(Method::DELETE, &[db_name], &[]).into_inner().send().await?;
        let bytes = collect_body(response, self.requests.dispatch()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replace a database's `_security` document.
    pub async fn put_security(&self, db_name: &str, security: &SecurityDoc) -> Result<DBOperationSuccess, CouchError> {
        let response = self
            .requests
            .request(Method::PUT, &[db_name, "_security"], &[])
            .json(security)
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(response, self.requests.dispatch()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `GET /_active_tasks`.
    pub async fn active_tasks(&self) -> Result<Vec<ActiveTask>, CouchError> {
        let response = self.requests.request(Method::GET, &["_active_tasks"], &[]).into_inner().send().await?;
        let bytes = collect_body(response, self.requests.dispatch()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Connect to a database, assuming it already exists.
    pub fn connect_to_db(&self, db_name: impl Into<String>) -> DBInUse {
        DBInUse::new(self.requests.clone(), db_name.into())
    }

    /// Create a database if it does not exist yet, then connect to it.
    /// Creation failure (e.g. the database already exists) is not
    /// propagated; the caller ends up connected either way.
    pub async fn create_and_connect_to_db(&self, db_name: impl Into<String>, shards: Option<i64>, replicas: Option<i64>) -> DBInUse {
        let db_name = db_name.into();
        let _ = self.create_db(&db_name, shards, replicas).await;
        DBInUse::new(self.requests.clone(), db_name)
    }

    /// Tag every outgoing request with a header-handler registry, dispatching
    /// matching response headers to observers without the gate needing to
    /// know what any of them mean.
    pub fn with_header_dispatch(mut self, dispatch: HeaderDispatch) -> Self {
        self.requests = self.requests.with_header_dispatch(dispatch);
        self
    }

    /// Submit a one-shot or continuous replication command to `_replicator`.
    pub async fn replicate(&self, command: &Value) -> Result<ReplicateResult, CouchError> {
        replicator::replicate(&self.requests, command).await
    }

    /// Cancel a replication by purging its `_replicator` document.
    pub async fn cancel_replication(&self, doc_id: &str) -> Result<CancelResult, CouchError> {
        replicator::cancel(&self.requests, doc_id).await
    }

    /// `GET /_scheduler/docs`.
    pub async fn scheduler_docs(&self) -> Result<Vec<SchedulerEntry>, CouchError> {
        replicator::scheduler_docs(&self.requests).await
    }

    /// `GET /_scheduler/jobs`.
    pub async fn scheduler_jobs(&self) -> Result<Vec<SchedulerEntry>, CouchError> {
        replicator::scheduler_jobs(&self.requests).await
    }
}

async fn collect_body(response: reqwest::Response, dispatch: &HeaderDispatch) -> Result<Vec<u8>, CouchError> {
    use response_gate::{gate, Gated, NotFoundPolicy};
    use futures_util::StreamExt;

    match gate(response, NotFoundPolicy::Fail, dispatch).await? {
        Gated::Absent => Ok(Vec::new()),
        Gated::Body { mut bytes_stream } => {
            let mut out = Vec::new();
            while let Some(chunk) = bytes_stream.next().await {
                out.extend_from_slice(&chunk?);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_clones_cheaply_and_scopes_a_db_handle() {
        let client = Client::new("http://localhost:5984");
        let _db = client.connect_to_db("test_db");
    }

    #[test]
    fn node_info_decodes_vendor_and_features() {
        let value = serde_json::json!({
            "couchdb": "Welcome",
            "version": "3.1.2",
            "git_sha": "572b68e72",
            "uuid": "7ecbe8fcc2cde610fe02ee82df51cbf7",
            "features": ["scheduler"],
            "vendor": { "name": "The Apache Software Foundation" }
        });
        let info: CouchDBInfo = serde_json::from_value(value).unwrap();
        assert_eq!(info.vendor.name, "The Apache Software Foundation");
        assert_eq!(info.features, vec!["scheduler".to_string()]);
    }

    #[test]
    fn active_task_flattens_kind_specific_fields_into_details() {
        let value = serde_json::json!({
            "pid": "<0.1.0>",
            "started_on": 100,
            "updated_on": 200,
            "type": "replication",
            "docs_written": 42
        });
        let task: ActiveTask = serde_json::from_value(value).unwrap();
        assert_eq!(task.kind, "replication");
        assert_eq!(task.details.get("docs_written"), Some(&serde_json::json!(42)));
    }
}
