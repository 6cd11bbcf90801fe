//! Streaming view decoder (C3): turns the byte stream of a view/`_all_docs`
//! response into a lazy sequence of [`ViewEvent`]s without ever holding the
//! whole response in memory — only one row at a time is materialized.
//!
//! The literal token-by-token state machine lives in [`State`]; the part of
//! it that has to cope with `key`/`value`/`doc` being arbitrary JSON delegates
//! to `crate::token::collect_value`, which assembles one subtree at a time
//! without ever holding more than the row currently in flight.
use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CouchError;
use crate::request::encode_query_value;
use crate::token::{collect_value, JsonToken};

/// Where a row's document ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum DocSlot<T> {
    /// `include_docs=true` and the server sent a real document.
    Included(T),
    /// `include_docs=true` but `doc` was null or absent.
    Missing,
    /// `include_docs=false`; no document was requested.
    NotRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow<K, V, T> {
    pub id: String,
    pub key: Option<K>,
    pub value: Option<V>,
    pub doc: DocSlot<T>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent<K, V, T> {
    Row(ViewRow<K, V, T>),
    TotalCount(i64),
    /// Per spec.md §4.3: if `offset` never appeared on the wire, a single
    /// `Offset(-1)` is synthesized at the very end of the stream. A real `-1`
    /// offset (which CouchDB never sends, but nothing stops a compatible
    /// server from doing so) is passed through as-is and is not conflated
    /// with the synthetic one; both just happen to carry the same value.
    Offset(i64),
    UpdateSequence(i64),
}

/// A view query: either a real `_design/<ddoc>/_view/<view>` or the
/// `_all_docs` pseudo-view.
#[derive(Debug, Clone)]
pub struct ViewQuery {
    pub target: ViewTarget,
    pub keys: Vec<Value>,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub descending: bool,
    pub include_docs: bool,
    pub reduce: Option<bool>,
    pub group_level: Option<u64>,
    pub stale: Option<String>,
    pub ignore_not_found: bool,
}

#[derive(Debug, Clone)]
pub enum ViewTarget {
    AllDocs,
    DesignView { design_doc: String, view: String },
}

impl ViewQuery {
    pub fn all_docs() -> Self {
        Self {
            target: ViewTarget::AllDocs,
            keys: Vec::new(),
            start_key: None,
            end_key: None,
            limit: None,
            skip: None,
            descending: false,
            include_docs: false,
            reduce: None,
            group_level: None,
            stale: None,
            ignore_not_found: false,
        }
    }

    pub fn view(design_doc: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            target: ViewTarget::DesignView {
                design_doc: design_doc.into(),
                view: view.into(),
            },
            ..Self::all_docs()
        }
    }

    pub fn path_segments(&self) -> Vec<String> {
        match &self.target {
            ViewTarget::AllDocs => vec!["_all_docs".to_string()],
            ViewTarget::DesignView { design_doc, view } => {
                vec!["_design".to_string(), design_doc.clone(), "_view".to_string(), view.clone()]
            }
        }
    }

    /// Non-`keys` query-string parameters, percent-encoded, ready to append
    /// to the request URL for the GET form of this query.
    pub fn query_params(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(sk) = &self.start_key {
            out.push(("start_key".into(), encode_json_param(sk)));
        }
        if let Some(ek) = &self.end_key {
            out.push(("end_key".into(), encode_json_param(ek)));
        }
        if let Some(limit) = self.limit {
            out.push(("limit".into(), limit.to_string()));
        }
        if let Some(skip) = self.skip {
            out.push(("skip".into(), skip.to_string()));
        }
        if self.descending {
            out.push(("descending".into(), "true".into()));
        }
        if self.include_docs {
            out.push(("include_docs".into(), "true".into()));
        }
        if let Some(reduce) = self.reduce {
            out.push(("reduce".into(), reduce.to_string()));
        }
        if let Some(group_level) = self.group_level {
            out.push(("group_level".into(), group_level.to_string()));
        }
        if let Some(stale) = &self.stale {
            out.push(("stale".into(), stale.clone()));
        }
        if self.keys.len() == 1 {
            out.push(("key".into(), encode_json_param(&self.keys[0])));
        }
        out
    }

    /// Multi-key requests are issued as POST with `{"keys": [...]}` in the
    /// body instead of a query-string `key=`.
    pub fn is_multi_key(&self) -> bool {
        self.keys.len() > 1
    }

    pub fn keys_body(&self) -> Value {
        serde_json::json!({ "keys": self.keys })
    }
}

fn encode_json_param(value: &Value) -> String {
    encode_query_value(&value.to_string())
}

/// Explicit driver states for the top-level object, named to match the
/// documented design: `ExpectTopObject` -> `InTopObject` -> (`InRowsArray`
/// consuming whole rows via `ValueBuilder`, which internally plays the part
/// of `InRow`/`ExpectKeyValue`/`ExpectDocValue`) -> `Done`.
enum State {
    ExpectTopObject,
    InTopObject,
    InRowsArray,
    Done,
}

/// Decode a view/`_all_docs` response body (as a token stream) into
/// [`ViewEvent`]s. `include_docs` and `ignore_not_found` mirror the request
/// that produced this response and govern how rows are materialized.
pub fn decode_view<K, V, T>(
    tokens: impl Stream<Item = Result<JsonToken, CouchError>>,
    include_docs: bool,
    ignore_not_found: bool,
) -> impl Stream<Item = Result<ViewEvent<K, V, T>, CouchError>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
    T: DeserializeOwned,
{
    try_stream! {
        futures_util::pin_mut!(tokens);
        let mut state = State::ExpectTopObject;
        let mut offset_seen = false;

        loop {
            let token = match tokens.next().await {
                Some(t) => t?,
                None => break,
            };

            match state {
                State::ExpectTopObject => {
                    match token {
                        JsonToken::StartObject => state = State::InTopObject,
                        _ => Err(CouchError::ViewResult { key: None, message: "expected top-level object".into() })?,
                    }
                }
                State::InTopObject => {
                    match token {
                        JsonToken::FieldName(name) => match name.as_str() {
                            "total_rows" => {
                                let n = expect_number(&mut tokens).await?;
                                yield ViewEvent::TotalCount(n as i64);
                            }
                            "offset" => {
                                let n = expect_number(&mut tokens).await?;
                                offset_seen = true;
                                yield ViewEvent::Offset(n as i64);
                            }
                            "update_seq" => {
                                let n = expect_number(&mut tokens).await?;
                                yield ViewEvent::UpdateSequence(n as i64);
                            }
                            "rows" => {
                                expect_start_array(&mut tokens).await?;
                                state = State::InRowsArray;
                            }
                            "error" => {
                                let message = expect_string(&mut tokens).await?;
                                Err(CouchError::ViewResult { key: None, message })?;
                            }
                            _ => {
                                skip_one_value(&mut tokens).await?;
                            }
                        },
                        JsonToken::EndObject => {
                            state = State::Done;
                        }
                        _ => Err(CouchError::ViewResult { key: None, message: "malformed top-level object".into() })?,
                    }
                }
                State::InRowsArray => {
                    match token {
                        JsonToken::EndArray => state = State::InTopObject,
                        JsonToken::StartObject => {
                            let row_value = collect_value(&mut tokens, token).await?;
                            if let Some(event) = materialize_row::<K, V, T>(row_value, include_docs, ignore_not_found)? {
                                yield event;
                            }
                        }
                        _ => Err(CouchError::ViewResult { key: None, message: "malformed row".into() })?,
                    }
                }
                State::Done => break,
            }

            if matches!(state, State::Done) {
                break;
            }
        }

        if !offset_seen {
            yield ViewEvent::Offset(-1);
        }
    }
}

async fn expect_number(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<f64, CouchError> {
    match next(tokens).await? {
        JsonToken::NumberValue(n) => Ok(n),
        _ => Err(CouchError::ViewResult { key: None, message: "expected a number".into() }),
    }
}

async fn expect_string(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<String, CouchError> {
    match next(tokens).await? {
        JsonToken::StringValue(s) => Ok(s),
        _ => Err(CouchError::ViewResult { key: None, message: "expected a string".into() }),
    }
}

async fn expect_start_array(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<(), CouchError> {
    match next(tokens).await? {
        JsonToken::StartArray => Ok(()),
        _ => Err(CouchError::ViewResult { key: None, message: "expected 'rows' to be an array".into() }),
    }
}

async fn next(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<JsonToken, CouchError> {
    tokens
        .next()
        .await
        .ok_or_else(|| CouchError::ViewResult { key: None, message: "truncated response".into() })?
}

/// Consume and discard one JSON value (scalar or nested) for an
/// unrecognized top-level key.
async fn skip_one_value(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<(), CouchError> {
    let first = next(tokens).await?;
    collect_value(tokens, first).await?;
    Ok(())
}

fn materialize_row<K, V, T>(
    row: Value,
    include_docs: bool,
    ignore_not_found: bool,
) -> Result<Option<ViewEvent<K, V, T>>, CouchError>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
    T: DeserializeOwned,
{
    let obj = match row.as_object() {
        Some(obj) => obj,
        None => return Err(CouchError::ViewResult { key: None, message: "row was not an object".into() }),
    };

    if let Some(err) = obj.get("error").and_then(Value::as_str) {
        let key = obj.get("key").cloned();
        if ignore_not_found && err == "not_found" {
            return Ok(None);
        }
        return Err(CouchError::ViewResult { key, message: err.to_string() });
    }

    let id = obj.get("id").and_then(Value::as_str).unwrap_or("").to_string();

    let key = match obj.get("key") {
        Some(Value::Null) | None => None,
        Some(v) => Some(deserialize_field(&id, "key", v.clone())?),
    };
    let value = match obj.get("value") {
        Some(Value::Null) | None => None,
        Some(v) => Some(deserialize_field(&id, "value", v.clone())?),
    };

    let doc = if include_docs {
        match obj.get("doc") {
            Some(Value::Null) | None => DocSlot::Missing,
            Some(v) => DocSlot::Included(deserialize_field(&id, "doc", v.clone())?),
        }
    } else {
        DocSlot::NotRequested
    };

    Ok(Some(ViewEvent::Row(ViewRow { id, key, value, doc })))
}

fn deserialize_field<U: DeserializeOwned>(row_id: &str, field: &str, value: Value) -> Result<U, CouchError> {
    serde_json::from_value(value).map_err(|e| CouchError::ViewResult {
        key: None,
        message: format!("row {row_id}: failed to decode '{field}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn ok_tokens(tokens: Vec<JsonToken>) -> impl Stream<Item = Result<JsonToken, CouchError>> {
        stream::iter(tokens.into_iter().map(Ok))
    }

    fn field(name: &str) -> JsonToken {
        JsonToken::FieldName(name.to_string())
    }

    #[tokio::test]
    async fn emits_total_rows_and_rows_with_docs() {
        let tokens = ok_tokens(vec![
            JsonToken::StartObject,
            field("total_rows"),
            JsonToken::NumberValue(2.0),
            field("offset"),
            JsonToken::NumberValue(0.0),
            field("rows"),
            JsonToken::StartArray,
            JsonToken::StartObject,
            field("id"),
            JsonToken::StringValue("doc1".into()),
            field("key"),
            JsonToken::StringValue("doc1".into()),
            field("value"),
            JsonToken::NumberValue(1.0),
            field("doc"),
            JsonToken::StartObject,
            field("_id"),
            JsonToken::StringValue("doc1".into()),
            JsonToken::EndObject,
            JsonToken::EndObject,
            JsonToken::EndArray,
            JsonToken::EndObject,
        ]);

        let decoded = decode_view::<String, i64, Value>(tokens, true, false);
        futures_util::pin_mut!(decoded);
        let mut events = vec![];
        while let Some(e) = decoded.next().await {
            events.push(e.unwrap());
        }
        assert_eq!(events[0], ViewEvent::TotalCount(2));
        assert_eq!(events[1], ViewEvent::Offset(0));
        match &events[2] {
            ViewEvent::Row(row) => {
                assert_eq!(row.id, "doc1");
                assert_eq!(row.key.as_deref(), Some("doc1"));
                assert_eq!(row.value, Some(1));
                assert!(matches!(row.doc, DocSlot::Included(_)));
            }
            _ => panic!("expected a row event"),
        }
    }

    #[tokio::test]
    async fn synthesizes_offset_when_absent() {
        let tokens = ok_tokens(vec![
            JsonToken::StartObject,
            field("total_rows"),
            JsonToken::NumberValue(0.0),
            field("rows"),
            JsonToken::StartArray,
            JsonToken::EndArray,
            JsonToken::EndObject,
        ]);
        let decoded = decode_view::<Value, Value, Value>(tokens, false, false);
        futures_util::pin_mut!(decoded);
        let mut events = vec![];
        while let Some(e) = decoded.next().await {
            events.push(e.unwrap());
        }
        assert_eq!(events.last(), Some(&ViewEvent::Offset(-1)));
    }

    #[tokio::test]
    async fn drops_not_found_row_when_ignored() {
        let tokens = ok_tokens(vec![
            JsonToken::StartObject,
            field("rows"),
            JsonToken::StartArray,
            JsonToken::StartObject,
            field("key"),
            JsonToken::StringValue("missing".into()),
            field("error"),
            JsonToken::StringValue("not_found".into()),
            JsonToken::EndObject,
            JsonToken::EndArray,
            JsonToken::EndObject,
        ]);
        let decoded = decode_view::<String, Value, Value>(tokens, false, true);
        futures_util::pin_mut!(decoded);
        let mut events = vec![];
        while let Some(e) = decoded.next().await {
            events.push(e.unwrap());
        }
        assert_eq!(events, vec![ViewEvent::Offset(-1)]);
    }

    #[tokio::test]
    async fn top_level_error_fails_the_stream() {
        let tokens = ok_tokens(vec![
            JsonToken::StartObject,
            field("error"),
            JsonToken::StringValue("boom".into()),
            JsonToken::EndObject,
        ]);
        let decoded = decode_view::<Value, Value, Value>(tokens, false, false);
        futures_util::pin_mut!(decoded);
        let mut saw_err = false;
        while let Some(e) = decoded.next().await {
            if e.is_err() {
                saw_err = true;
            }
        }
        assert!(saw_err);
    }
}
