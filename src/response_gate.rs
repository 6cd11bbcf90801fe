//! Inspects an HTTP response's status before a single byte of its body is
//! read, translating well-known status codes into typed errors and leaving
//! everything else to be decoded by the caller (a streaming decoder, or a
//! single `serde_json::from_slice`).
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Response, StatusCode};

use crate::error::{CouchDBError, CouchError};

/// Whether a 404 on this particular operation means "the resource really
/// isn't there, fail" or "treat absence as a normal, valid outcome".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    Fail,
    NullIfAbsent,
}

/// Outcome of passing a response through the gate. `Absent` only occurs for
/// `NotFoundPolicy::NullIfAbsent` operations on a 404.
pub enum Gated {
    Body {
        bytes_stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    },
    Absent,
}

/// Run a response through status triage. On success, returns either the
/// byte stream (2xx) or `Gated::Absent` (404 under `NullIfAbsent`).
///
/// `dispatch` is run against this response's headers before a single byte of
/// the body is touched, regardless of status — a handler may care about a
/// header on an error response just as much as on a success.
pub async fn gate(response: Response, not_found: NotFoundPolicy, dispatch: &HeaderDispatch) -> Result<Gated, CouchError> {
    let status = response.status();
    tracing::debug!(status = status.as_u16(), "response gate triage");
    dispatch.dispatch(&response);

    if status.is_success() {
        return Ok(Gated::Body {
            bytes_stream: Box::pin(response.bytes_stream()),
        });
    }

    match status {
        StatusCode::UNAUTHORIZED => {
            let body = response.bytes().await.unwrap_or_default();
            let couch_err = decode_couch_error(&body);
            Err(CouchError::Unauthorized(couch_err, status.as_u16()))
        }
        StatusCode::NOT_FOUND if not_found == NotFoundPolicy::NullIfAbsent => Ok(Gated::Absent),
        StatusCode::NOT_FOUND => Err(CouchError::NotFound),
        StatusCode::CONFLICT => Err(CouchError::Conflict),
        other => {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = other.as_u16(), body = %body, "non-2xx response");
            Err(CouchError::Http {
                status: other.as_u16(),
                body,
            })
        }
    }
}

fn decode_couch_error(body: &[u8]) -> CouchDBError {
    serde_json::from_slice(body).unwrap_or_else(|_| CouchDBError {
        error: "unauthorized".into(),
        reason: String::from_utf8_lossy(body).into_owned(),
    })
}

/// A registry of response-header handlers keyed by prefix, e.g. dispatching
/// every `X-Couch-*` header to an observer without the gate itself needing
/// to know what each one means. Registered on a [`crate::Client`] via
/// [`crate::Client::with_header_dispatch`] and threaded through every request
/// made from it; `gate` runs it against every response it sees.
pub struct HeaderDispatch {
    handlers: Vec<(String, Box<dyn Fn(&str, &str) + Send + Sync>)>,
}

impl HeaderDispatch {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register(mut self, prefix: impl Into<String>, handler: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.handlers.push((prefix.into(), Box::new(handler)));
        self
    }

    pub fn dispatch(&self, response: &Response) {
        self.dispatch_headers(response.headers());
    }

    fn dispatch_headers(&self, headers: &reqwest::header::HeaderMap) {
        for (name, value) in headers {
            let name = name.as_str();
            let value = value.to_str().unwrap_or_default();
            for (prefix, handler) in &self.handlers {
                if name.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase()) {
                    handler(name, value);
                }
            }
        }
    }
}

impl Default for HeaderDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeaderDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderDispatch").field("handlers", &self.handlers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_couch_error() {
        let body = serde_json::to_vec(&serde_json::json!({"error": "unauthorized", "reason": "bad creds"})).unwrap();
        let err = decode_couch_error(&body);
        assert_eq!(err.error, "unauthorized");
        assert_eq!(err.reason, "bad creds");
    }

    #[test]
    fn falls_back_on_unparseable_body() {
        let err = decode_couch_error(b"not json");
        assert_eq!(err.error, "unauthorized");
        assert_eq!(err.reason, "not json");
    }

    #[test]
    fn header_dispatch_invokes_handler_for_matching_prefix_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let dispatch = HeaderDispatch::new().register("x-couch-", move |_, value| {
            assert_eq!(value, "abc123");
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("x-couch-request-id"), HeaderValue::from_static("abc123"));
        headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("application/json"));

        dispatch.dispatch_headers(&headers);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
