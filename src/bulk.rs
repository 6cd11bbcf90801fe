//! Bulk Result Decoder (C4): the response to `_bulk_docs` is a bare JSON
//! array of `{id, rev?, ok?, error?, reason?}` objects. This streams each
//! element out as soon as it is complete instead of buffering the array.
use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::CouchError;
use crate::token::{collect_value, JsonToken};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdateResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Decode a `_bulk_docs` response body (as a token stream) into
/// [`BulkUpdateResult`]s, one per completed array element.
pub fn decode_bulk_results(
    tokens: impl Stream<Item = Result<JsonToken, CouchError>>,
) -> impl Stream<Item = Result<BulkUpdateResult, CouchError>> {
    try_stream! {
        futures_util::pin_mut!(tokens);

        match tokens.next().await {
            Some(Ok(JsonToken::StartArray)) => {}
            Some(Ok(_)) => Err(CouchError::InvalidJson(serde::de::Error::custom("expected a top-level array")))?,
            Some(Err(e)) => Err(e)?,
            None => return,
        }

        loop {
            let token = match tokens.next().await {
                Some(t) => t?,
                None => break,
            };
            if matches!(token, JsonToken::EndArray) {
                break;
            }
            let element = collect_value(&mut tokens, token).await?;
            let result: BulkUpdateResult = serde_json::from_value(element)?;
            yield result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn field(name: &str) -> JsonToken {
        JsonToken::FieldName(name.to_string())
    }

    #[tokio::test]
    async fn streams_success_and_error_entries() {
        let tokens = stream::iter(
            vec![
                JsonToken::StartArray,
                JsonToken::StartObject,
                field("id"),
                JsonToken::StringValue("a".into()),
                field("rev"),
                JsonToken::StringValue("1-x".into()),
                field("ok"),
                JsonToken::BooleanValue(true),
                JsonToken::EndObject,
                JsonToken::StartObject,
                field("id"),
                JsonToken::StringValue("b".into()),
                field("error"),
                JsonToken::StringValue("conflict".into()),
                field("reason"),
                JsonToken::StringValue("rev mismatch".into()),
                JsonToken::EndObject,
                JsonToken::EndArray,
            ]
            .into_iter()
            .map(Ok),
        );

        let decoded = decode_bulk_results(tokens);
        futures_util::pin_mut!(decoded);
        let mut out = vec![];
        while let Some(r) = decoded.next().await {
            out.push(r.unwrap());
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "a");
        assert_eq!(out[0].ok, Some(true));
        assert_eq!(out[1].error.as_deref(), Some("conflict"));
    }
}
