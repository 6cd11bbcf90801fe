//! Mango Query Runner (C8): POSTs a selector query to `_find` and streams the
//! result without buffering the whole `docs` array.
use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CouchError;
use crate::token::{collect_value, JsonToken};

#[derive(Debug, Clone, PartialEq)]
pub struct MangoQueryResult<T> {
    pub doc: Option<T>,
    pub bookmark: Option<String>,
}

/// Decode a `_find` response body (as a token stream) into
/// [`MangoQueryResult`]s: one per element of `docs`, and then — if the
/// response carried a `bookmark` — one final bookmark-only result.
pub fn decode_mango_results<T>(
    tokens: impl Stream<Item = Result<JsonToken, CouchError>>,
) -> impl Stream<Item = Result<MangoQueryResult<T>, CouchError>>
where
    T: DeserializeOwned,
{
    try_stream! {
        futures_util::pin_mut!(tokens);

        match next(&mut tokens).await? {
            JsonToken::StartObject => {}
            _ => Err(mango_err("expected a top-level object"))?,
        }

        let mut bookmark: Option<String> = None;

        loop {
            let token = next(&mut tokens).await?;
            match token {
                JsonToken::EndObject => break,
                JsonToken::FieldName(name) => match name.as_str() {
                    "docs" => {
                        match next(&mut tokens).await? {
                            JsonToken::StartArray => {}
                            _ => Err(mango_err("expected 'docs' to be an array"))?,
                        }
                        loop {
                            let t = next(&mut tokens).await?;
                            if matches!(t, JsonToken::EndArray) {
                                break;
                            }
                            let value = collect_value(&mut tokens, t).await?;
                            let doc: T = serde_json::from_value(value)?;
                            yield MangoQueryResult { doc: Some(doc), bookmark: None };
                        }
                    }
                    "bookmark" => {
                        let t = next(&mut tokens).await?;
                        bookmark = match collect_value(&mut tokens, t).await? {
                            Value::String(s) => Some(s),
                            Value::Null => None,
                            other => Err(mango_err(&format!("unexpected bookmark shape: {other}")))?,
                        };
                    }
                    "error" => {
                        let error = expect_string(&mut tokens).await?;
                        let reason = expect_field_string(&mut tokens, "reason").await.unwrap_or_default();
                        Err(CouchError::MangoResult { error, reason })?;
                    }
                    _ => {
                        let t = next(&mut tokens).await?;
                        collect_value(&mut tokens, t).await?;
                    }
                },
                _ => Err(mango_err("malformed top-level object"))?,
            }
        }

        if let Some(bookmark) = bookmark {
            yield MangoQueryResult { doc: None, bookmark: Some(bookmark) };
        }
    }
}

async fn next(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<JsonToken, CouchError> {
    tokens.next().await.ok_or_else(|| mango_err("truncated response"))?
}

async fn expect_string(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
) -> Result<String, CouchError> {
    match next(tokens).await? {
        JsonToken::StringValue(s) => Ok(s),
        _ => Err(mango_err("expected a string")),
    }
}

/// Best-effort read of a `"reason"` field immediately following `"error"` in
/// the same object; CouchDB always sends both together on `_find` failures,
/// but this tolerates a reason-less error body rather than failing harder.
async fn expect_field_string(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
    field: &str,
) -> Result<String, CouchError> {
    match next(tokens).await? {
        JsonToken::FieldName(name) if name == field => expect_string(tokens).await,
        _ => Err(mango_err("expected another field")),
    }
}

fn mango_err(message: &str) -> CouchError {
    CouchError::MangoResult { error: "invalid_response".into(), reason: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn field(name: &str) -> JsonToken {
        JsonToken::FieldName(name.to_string())
    }

    fn ok_tokens(tokens: Vec<JsonToken>) -> impl Stream<Item = Result<JsonToken, CouchError>> {
        stream::iter(tokens.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn emits_one_result_per_doc_then_bookmark() {
        let tokens = ok_tokens(vec![
            JsonToken::StartObject,
            field("docs"),
            JsonToken::StartArray,
            JsonToken::StartObject,
            field("_id"),
            JsonToken::StringValue("a".into()),
            JsonToken::EndObject,
            JsonToken::EndArray,
            field("bookmark"),
            JsonToken::StringValue("cursor-1".into()),
            JsonToken::EndObject,
        ]);
        let decoded = decode_mango_results::<Value>(tokens);
        futures_util::pin_mut!(decoded);
        let mut results = vec![];
        while let Some(r) = decoded.next().await {
            results.push(r.unwrap());
        }
        assert_eq!(results.len(), 2);
        assert!(results[0].doc.is_some());
        assert_eq!(results[1].bookmark.as_deref(), Some("cursor-1"));
    }

    #[tokio::test]
    async fn surfaces_mango_error() {
        let tokens = ok_tokens(vec![
            JsonToken::StartObject,
            field("error"),
            JsonToken::StringValue("invalid_sort_json".into()),
            field("reason"),
            JsonToken::StringValue("sort field must be in the selector".into()),
            JsonToken::EndObject,
        ]);
        let decoded = decode_mango_results::<Value>(tokens);
        futures_util::pin_mut!(decoded);
        let mut saw_err = false;
        while let Some(r) = decoded.next().await {
            if let Err(CouchError::MangoResult { error, .. }) = r {
                assert_eq!(error, "invalid_sort_json");
                saw_err = true;
            }
        }
        assert!(saw_err);
    }
}
