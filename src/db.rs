//! The connected-database handle: wires the request builder, response gate
//! and the C3-C9 streaming decoders into one public API, the way the
//! teacher's `impl DBInUse` wired `reqwest` calls directly.
use std::collections::BTreeMap;

use futures_util::{Stream, StreamExt};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::bulk::{decode_bulk_results, BulkUpdateResult};
use crate::changes::{self, BackoffConfig, Change, DocResolver};
use crate::design_doc::{reconcile, reconcile_mango, DesignDocDeclarations, MangoIndexSpec, ReconcileOutcome};
use crate::error::CouchError;
use crate::mango::{decode_mango_results, MangoQueryResult};
use crate::pagination::{self, BatchFetcher, DEFAULT_BATCH_SIZE};
use crate::request::RequestBuilder;
use crate::response_gate::{gate, Gated, NotFoundPolicy};
use crate::token::tokenize;
use crate::types::{
    BulkData, BulkDocs, BulkDocsResponse, BulkGetResponse, DBInfo, DesignDocsList, DocResponse,
    GetDocRequestParams, GetMultipleDocs, Index, IndexResponse, MangoQuery,
};
use crate::view::{decode_view, ViewEvent, ViewQuery};
use crate::ParseQueryParams;

/// A database that has already been confirmed to exist (or is being created
/// on first use), bound to one name on one [`crate::Client`].
#[derive(Debug, Clone)]
pub struct DBInUse {
    requests: RequestBuilder,
    db_name: String,
}

impl DBInUse {
    pub(crate) fn new(requests: RequestBuilder, db_name: String) -> Self {
        Self { requests, db_name }
    }

    /// Database information. More [info](https://docs.couchdb.org/en/stable/api/database/common.html#get--db)
    pub async fn info(&self) -> Result<DBInfo, CouchError> {
        let response = self.requests.request(Method::GET, &[&self.db_name], &[]).into_inner().send().await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Listing of this database's design documents, shaped like `_all_docs`.
    pub async fn design_docs(&self) -> Result<DesignDocsList, CouchError> {
        let response = self
            .requests
            .request(Method::GET, &[&self.db_name, "_design_docs"], &[])
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Create or update a document. With neither `id` nor `rev`, a uuid v4 id
    /// is generated.
    pub async fn create_or_update_doc<T>(
        &self,
        doc_body: &T,
        id: Option<&str>,
        rev: Option<&str>,
    ) -> Result<DocResponse, CouchError>
    where
        T: Serialize,
    {
        let generated;
        let id = match (id, rev) {
            (Some(id), _) => id,
            (None, _) => {
                generated = Uuid::new_v4().to_string();
                &generated
            }
        };
        let query: Vec<(&str, String)> = match rev {
            Some(rev) => vec![("rev", rev.to_string())],
            None => vec![],
        };
        let response = self
            .requests
            .request(Method::PUT, &[&self.db_name, id], &query)
            .json(doc_body)
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Mark a document deleted. More [info](https://docs.couchdb.org/en/stable/api/document/common.html#delete--db-docid)
    pub async fn delete_doc(&self, id: &str, rev: &str) -> Result<DocResponse, CouchError> {
        let response = self
            .requests
            .request(Method::DELETE, &[&self.db_name, id], &[("rev", rev.to_string())])
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fetch one document by id. Unless `params` pins a `rev`, the latest
    /// revision is returned.
    pub async fn get_doc(&self, id: &str, params: Option<&GetDocRequestParams>) -> Result<Value, CouchError> {
        let default = GetDocRequestParams::default();
        let raw_query = params.unwrap_or(&default).parse_params();
        let response = self
            .requests
            .request_with_raw_query(Method::GET, &[&self.db_name, id], &raw_query)
            .into_inner()
            .send()
            .await?;
        let gated = gate(response, NotFoundPolicy::NullIfAbsent, self.requests.dispatch()).await?;
        match gated {
            Gated::Absent => Err(CouchError::NotFound),
            Gated::Body { bytes_stream } => {
                let bytes = collect_bytes_stream(bytes_stream).await?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    /// List documents via `_all_docs`, aggregated into one response rather
    /// than streamed.
    pub async fn list_docs(&self, include_docs: bool, limit: Option<i64>) -> Result<GetMultipleDocs, CouchError> {
        let mut body = serde_json::json!({ "include_docs": include_docs });
        if let Some(limit) = limit {
            body["limit"] = serde_json::json!(limit);
        }
        let response = self
            .requests
            .request(Method::POST, &[&self.db_name, "_all_docs"], &[])
            .json(&body)
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Stream a view (or `_all_docs`) result without buffering the whole
    /// body. This is the direct entry point for C3.
    pub fn view<'a, K, V, T>(&'a self, query: &ViewQuery) -> impl Stream<Item = Result<ViewEvent<K, V, T>, CouchError>> + 'a
    where
        K: DeserializeOwned + 'a,
        V: DeserializeOwned + 'a,
        T: DeserializeOwned + 'a,
    {
        let segments: Vec<String> = std::iter::once(self.db_name.clone()).chain(query.path_segments()).collect();
        let include_docs = query.include_docs;
        let ignore_not_found = query.ignore_not_found;
        let is_multi_key = query.is_multi_key();
        let query_params = query.query_params();
        let keys_body = if is_multi_key { Some(query.keys_body()) } else { None };

        async_stream::try_stream! {
            let segment_refs: Vec<&str> = segments.iter().map(String::as_str).collect();
            let query_refs: Vec<(&str, String)> = query_params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

            let response = if let Some(body) = &keys_body {
                self.requests.request(Method::POST, &segment_refs, &query_refs).json(body).into_inner().send().await?
            } else {
                self.requests.request(Method::GET, &segment_refs, &query_refs).into_inner().send().await?
            };

            let gated = gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?;
            let bytes_stream = match gated {
                Gated::Body { bytes_stream } => bytes_stream,
                Gated::Absent => unreachable!("NotFoundPolicy::Fail never returns Absent"),
            };
            let tokens = tokenize(bytes_stream);
            let decoded = decode_view::<K, V, T>(tokens, include_docs, ignore_not_found);
            futures_util::pin_mut!(decoded);
            while let Some(event) = decoded.next().await {
                yield event?;
            }
        }
    }

    /// Batch an unbounded id sequence into bounded `_all_docs` lookups,
    /// rolling up total/offset/update-seq across batches. This is C5.
    pub fn paginate_ids<'a, T>(
        &'a self,
        ids: impl Stream<Item = String> + Send + 'a,
        batch_size: Option<usize>,
    ) -> impl Stream<Item = Result<ViewEvent<Value, Value, T>, CouchError>> + 'a
    where
        T: DeserializeOwned + Send + Clone + 'a,
    {
        let fetch: BatchFetcher<'a, Value, Value, T> = Box::new(move |batch: Vec<String>| {
            let mut query = ViewQuery::all_docs();
            query.include_docs = true;
            query.keys = batch.into_iter().map(Value::String).collect();
            Box::pin(self.view::<Value, Value, T>(&query))
        });
        pagination::paginate(ids, batch_size.unwrap_or(DEFAULT_BATCH_SIZE), fetch)
    }

    /// `_bulk_docs`: stream the result array element-by-element. Wires C4.
    pub fn bulk_docs<'a, T>(&'a self, docs: &'a BulkDocs<T>) -> impl Stream<Item = Result<BulkUpdateResult, CouchError>> + 'a
    where
        T: Serialize,
    {
        async_stream::try_stream! {
            let response = self
                .requests
                .request(Method::POST, &[&self.db_name, "_bulk_docs"], &[])
                .json(docs)
                .into_inner()
                .send()
                .await?;
            let gated = gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?;
            let bytes_stream = match gated {
                Gated::Body { bytes_stream } => bytes_stream,
                Gated::Absent => unreachable!("NotFoundPolicy::Fail never returns Absent"),
            };
            let tokens = tokenize(bytes_stream);
            let decoded = decode_bulk_results(tokens);
            futures_util::pin_mut!(decoded);
            while let Some(result) = decoded.next().await {
                yield result?;
            }
        }
    }

    /// Non-streaming bulk-docs call returning the whole response at once,
    /// kept for callers that just want `BulkDocsResponse` the way the
    /// teacher's API shaped it.
    pub async fn bulk_docs_collected<T>(&self, docs: &BulkDocs<T>) -> Result<BulkDocsResponse, CouchError>
    where
        T: Serialize,
    {
        let response = self
            .requests
            .request(Method::POST, &[&self.db_name, "_bulk_docs"], &[])
            .json(docs)
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        let results: Vec<crate::types::BulkDocsRes> = serde_json::from_slice(&bytes)?;
        Ok(BulkDocsResponse(results))
    }

    /// `_bulk_get`: fetch specific ids/revisions in one round trip.
    pub async fn bulk_get<T>(&self, docs: &BulkData<T>) -> Result<BulkGetResponse, CouchError>
    where
        T: Serialize,
    {
        let response = self
            .requests
            .request(Method::POST, &[&self.db_name, "_bulk_get"], &[])
            .json(docs)
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `_find`: stream Mango results without buffering the `docs` array.
    /// Wires C8.
    pub fn find<'a, T>(&'a self, query: &'a MangoQuery) -> impl Stream<Item = Result<MangoQueryResult<T>, CouchError>> + 'a
    where
        T: DeserializeOwned + 'a,
    {
        async_stream::try_stream! {
            let response = self
                .requests
                .request(Method::POST, &[&self.db_name, "_find"], &[])
                .json(query)
                .into_inner()
                .send()
                .await?;
            let gated = gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?;
            let bytes_stream = match gated {
                Gated::Body { bytes_stream } => bytes_stream,
                Gated::Absent => unreachable!("NotFoundPolicy::Fail never returns Absent"),
            };
            let tokens = tokenize(bytes_stream);
            let decoded = decode_mango_results::<T>(tokens);
            futures_util::pin_mut!(decoded);
            while let Some(result) = decoded.next().await {
                yield result?;
            }
        }
    }

    /// Continuous `_changes` feed with automatic resume/backoff. Wires C6.
    pub fn changes_stream<T>(
        &self,
        since: impl Into<String>,
        resolver: impl DocResolver<T> + 'static,
        backoff: BackoffConfig,
    ) -> impl Stream<Item = Change<T>>
    where
        T: Send + 'static,
    {
        changes::subscribe(self.requests.clone(), self.db_name.clone(), since.into(), resolver, backoff)
    }

    /// Reconcile code-declared views/filters/shows/lists/update-handlers
    /// into a design document. Wires C7.
    pub async fn reconcile_design_doc(
        &self,
        design_doc_id: &str,
        declarations: &DesignDocDeclarations,
        language: &str,
        force_update: bool,
        update_if_exists: bool,
    ) -> Result<ReconcileOutcome, CouchError> {
        reconcile(&self.requests, &self.db_name, design_doc_id, declarations, language, force_update, update_if_exists).await
    }

    /// Reconcile a Mango index design document (`_design/<doc_type>_mango`,
    /// `language: "query"`) the same way [`DBInUse::reconcile_design_doc`]
    /// reconciles an ordinary one, merging `views` by name.
    pub async fn reconcile_mango_index_doc(
        &self,
        doc_type: &str,
        views: &BTreeMap<String, MangoIndexSpec>,
        force_update: bool,
        update_if_exists: bool,
    ) -> Result<ReconcileOutcome, CouchError> {
        reconcile_mango(&self.requests, &self.db_name, doc_type, views, force_update, update_if_exists).await
    }

    /// `POST <db>/_index`. More [info](https://docs.couchdb.org/en/stable/api/database/find.html#db-index)
    pub async fn create_index(&self, index: &Index) -> Result<IndexResponse, CouchError> {
        let response = self
            .requests
            .request(Method::POST, &[&self.db_name, "_index"], &[])
            .json(index)
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_index(&self) -> Result<crate::types::GetIndexResponse, CouchError> {
        let response = self
            .requests
            .request(Method::GET, &[&self.db_name, "_index"], &[])
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn delete_index(&self, ddoc: &str, index_name: &str) -> Result<(), CouchError> {
        let response = self
            .requests
            .request(Method::DELETE, &[&self.db_name, "_index", ddoc, "json", index_name], &[])
            .into_inner()
            .send()
            .await?;
        gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?;
        Ok(())
    }

    /// Purge the named documents entirely, discovering their full revision
    /// history via `_revs_info` first.
    pub async fn purge_docs(&self, doc_ids: Vec<&str>) -> Result<Value, CouchError> {
        let mut body = serde_json::Map::new();
        for id in doc_ids {
            let info = self.get_doc(id, Some(&GetDocRequestParams::default().revs_info(true).deleted(true))).await?;
            let revs: Vec<String> = info
                .get("_revs_info")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(|e| e.get("rev").and_then(Value::as_str)).map(str::to_string).collect())
                .unwrap_or_default();
            body.insert(id.to_string(), Value::Array(revs.into_iter().map(Value::String).collect()));
        }

        let response = self
            .requests
            .request(Method::POST, &[&self.db_name, "_purge"], &[])
            .json(&Value::Object(body))
            .into_inner()
            .send()
            .await?;
        let bytes = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fetch an attachment's raw bytes. `rev` pins a historical revision;
    /// `None` fetches the attachment off the current revision.
    pub async fn get_attachment(&self, id: &str, attachment_name: &str, rev: Option<&str>) -> Result<Vec<u8>, CouchError> {
        let query: Vec<(&str, String)> = rev.map(|r| vec![("rev", r.to_string())]).unwrap_or_default();
        let response = self
            .requests
            .request(Method::GET, &[&self.db_name, id, attachment_name], &query)
            .into_inner()
            .send()
            .await?;
        let gated = gate(response, NotFoundPolicy::NullIfAbsent, self.requests.dispatch()).await?;
        match gated {
            Gated::Absent => Err(CouchError::NotFound),
            Gated::Body { bytes_stream } => collect_bytes_stream(bytes_stream).await,
        }
    }

    /// Upload an attachment, pinned to the document's current `rev` (as with
    /// any other write, a stale `rev` surfaces as [`CouchError::Conflict`]).
    pub async fn put_attachment(
        &self,
        id: &str,
        attachment_name: &str,
        rev: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<DocResponse, CouchError> {
        let response = self
            .requests
            .request(Method::PUT, &[&self.db_name, id, attachment_name], &[("rev", rev.to_string())])
            .body_with_content_type(bytes, content_type)
            .into_inner()
            .send()
            .await?;
        let body = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Delete an attachment, pinned to the document's current `rev`.
    pub async fn delete_attachment(&self, id: &str, attachment_name: &str, rev: &str) -> Result<DocResponse, CouchError> {
        let response = self
            .requests
            .request(Method::DELETE, &[&self.db_name, id, attachment_name], &[("rev", rev.to_string())])
            .into_inner()
            .send()
            .await?;
        let body = collect_body(gate(response, NotFoundPolicy::Fail, self.requests.dispatch()).await?).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

async fn collect_body(gated: Gated) -> Result<Vec<u8>, CouchError> {
    match gated {
        Gated::Absent => Ok(Vec::new()),
        Gated::Body { bytes_stream } => collect_bytes_stream(bytes_stream).await,
    }
}

async fn collect_bytes_stream(
    mut bytes_stream: std::pin::Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
) -> Result<Vec<u8>, CouchError> {
    let mut out = Vec::new();
    while let Some(chunk) = bytes_stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
