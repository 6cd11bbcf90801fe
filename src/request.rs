//! Builds the method, URI, headers and body for one logical operation.
//!
//! Every higher-level module (the view decoder, the changes subscriber, the
//! Mango runner, the replicator, the `DBInUse` facade) goes through
//! [`RequestBuilder`] instead of formatting URLs by hand. No retry logic
//! lives here; that belongs to the response gate (`crate::response_gate`) and
//! the change feed's backoff loop (`crate::changes`).
use std::sync::Arc;

use reqwest::{Client as HttpClient, Method, RequestBuilder as ReqwestBuilder};

use crate::response_gate::HeaderDispatch;

/// Shared, cheap-to-clone request defaults: base URL and optional basic auth.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    http: HttpClient,
    base_url: String,
    auth: Option<(String, String)>,
    correlation_id: Option<String>,
    dispatch: Arc<HeaderDispatch>,
}

impl RequestBuilder {
    pub fn new(http: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: trim_trailing_slash(base_url.into()),
            auth: None,
            correlation_id: None,
            dispatch: Arc::new(HeaderDispatch::new()),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_header_dispatch(mut self, dispatch: HeaderDispatch) -> Self {
        self.dispatch = Arc::new(dispatch);
        self
    }

    /// The header-handler registry every response gated through a request
    /// built by this builder is run against.
    pub fn dispatch(&self) -> &HeaderDispatch {
        &self.dispatch
    }

    /// Join `base_url` with `segments`, collapsing adjacent `/`, then attach
    /// `query` (already individual key/value pairs, URL-encoded by
    /// `reqwest`'s `.query()`), basic auth and the correlation header.
    /// `method` is remembered so [`Req::into_inner`] can add a default JSON
    /// content type, but only if the body builder never set one itself.
    pub fn request(&self, method: Method, segments: &[&str], query: &[(&str, String)]) -> Req {
        let path = join_segments(segments);
        let url = format!("{}/{}", self.base_url, path);
        let mut builder = self.http.request(method.clone(), &url);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some((user, pass)) = &self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(id) = &self.correlation_id {
            builder = builder.header("X-Couch-Request-ID", id);
        }
        Req::new(builder, carries_body_by_default(&method))
    }

    /// Same as [`RequestBuilder::request`], but for callers holding an
    /// already-assembled, already-encoded query string (e.g. the output of a
    /// [`crate::ParseQueryParams`] builder) instead of individual pairs.
    pub fn request_with_raw_query(&self, method: Method, segments: &[&str], raw_query: &str) -> Req {
        let path = join_segments(segments);
        let url = if raw_query.is_empty() {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/{}?{}", self.base_url, path, raw_query)
        };
        let mut builder = self.http.request(method.clone(), &url);
        if let Some((user, pass)) = &self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(id) = &self.correlation_id {
            builder = builder.header("X-Couch-Request-ID", id);
        }
        Req::new(builder, carries_body_by_default(&method))
    }
}

/// Thin wrapper around `reqwest::RequestBuilder` so call sites can attach a
/// JSON body or raw attachment bytes without reaching into `reqwest`
/// directly. Tracks whether something has already set a `Content-Type` —
/// `.json()` (which sets one itself) or `.body_with_content_type()` — so
/// [`Req::into_inner`] adds the default `application/json` header for
/// body-carrying methods exactly once, and never on top of an explicit one.
pub struct Req {
    builder: ReqwestBuilder,
    carries_body_by_default: bool,
    content_type_set: bool,
}

impl Req {
    fn new(builder: ReqwestBuilder, carries_body_by_default: bool) -> Self {
        Self { builder, carries_body_by_default, content_type_set: false }
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, body: &T) -> Self {
        self.builder = self.builder.json(body);
        self.content_type_set = true;
        self
    }

    /// Attachment upload: caller supplies the exact content type, overriding
    /// the default `application/json` header added for body-carrying methods.
    pub fn body_with_content_type(mut self, bytes: Vec<u8>, content_type: &str) -> Self {
        self.builder = self.builder.header("Content-Type", content_type).body(bytes);
        self.content_type_set = true;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if name.eq_ignore_ascii_case("content-type") {
            self.content_type_set = true;
        }
        self.builder = self.builder.header(name, value);
        self
    }

    pub fn into_inner(mut self) -> ReqwestBuilder {
        if self.carries_body_by_default && !self.content_type_set {
            self.builder = self.builder.header("Content-Type", "application/json");
        }
        self.builder
    }
}

fn carries_body_by_default(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

fn trim_trailing_slash(mut s: String) -> String {
    while s.ends_with('/') {
        s.pop();
    }
    s
}

/// Join path segments with `/`, collapsing any adjacent `/` left over from a
/// segment that itself contains leading/trailing slashes (e.g. a design
/// document id like `_design/foo`).
fn join_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .flat_map(|s| s.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-encode a single query value the way `reqwest::RequestBuilder::query`
/// would, exposed for callers that need to build a raw query string (e.g. the
/// multi-key view GET request, which also needs a JSON-encoded `keys` value).
pub fn encode_query_value(value: &str) -> String {
    url_escape(value)
}

fn url_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_adjacent_slashes() {
        assert_eq!(join_segments(&["db", "/_design/foo/", "_view/bar"]), "db/_design/foo/_view/bar");
    }

    #[test]
    fn drops_empty_segments() {
        assert_eq!(join_segments(&["db", "", "doc"]), "db/doc");
    }

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(encode_query_value("a b"), "a%20b");
        assert_eq!(encode_query_value("a/b"), "a%2Fb");
    }

    #[test]
    fn attachment_upload_does_not_duplicate_content_type() {
        let builder = RequestBuilder::new(reqwest::Client::new(), "http://localhost:5984");
        let built = builder
            .request(Method::PUT, &["db", "doc", "att"], &[("rev", "1-x".to_string())])
            .body_with_content_type(vec![1, 2, 3], "image/png")
            .into_inner()
            .build()
            .unwrap();
        let content_types: Vec<_> = built.headers().get_all("content-type").iter().collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0], "image/png");
    }

    #[test]
    fn json_body_does_not_duplicate_content_type() {
        let builder = RequestBuilder::new(reqwest::Client::new(), "http://localhost:5984");
        let built = builder
            .request(Method::POST, &["db", "_bulk_docs"], &[])
            .json(&serde_json::json!({"a": 1}))
            .into_inner()
            .build()
            .unwrap();
        let content_types: Vec<_> = built.headers().get_all("content-type").iter().collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0], "application/json");
    }

    #[test]
    fn put_with_no_explicit_body_gets_the_default_json_content_type() {
        let builder = RequestBuilder::new(reqwest::Client::new(), "http://localhost:5984");
        let built = builder.request(Method::PUT, &["db"], &[]).into_inner().build().unwrap();
        assert_eq!(built.headers().get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn get_carries_no_default_content_type() {
        let builder = RequestBuilder::new(reqwest::Client::new(), "http://localhost:5984");
        let built = builder.request(Method::GET, &["db", "doc"], &[]).into_inner().build().unwrap();
        assert!(built.headers().get("content-type").is_none());
    }
}
