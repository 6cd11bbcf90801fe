use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error body the server sends back for non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDBError {
    pub error: String,
    pub reason: String,
}

/// Every error this crate can surface to a caller.
///
/// Transport/protocol errors (`InvalidRequest`, `NotFound`, `Conflict`,
/// `Unauthorized`, `Http`) are produced by the response gate before a body is
/// decoded. Semantic errors (`ViewResult`, `MangoResult`) are produced while
/// decoding an already-2xx body.
#[derive(Error, Debug)]
pub enum CouchError {
    #[error("unable to reach db")]
    InvalidRequest(#[from] reqwest::Error),
    #[error("unable to parse json: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("not found")]
    NotFound,
    #[error("conflict: document revision is stale")]
    Conflict,
    #[error("status code: {1}, meaning: {}, reason: {}", .0.error, .0.reason)]
    Unauthorized(CouchDBError, u16),
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("view result error: {message}")]
    ViewResult { key: Option<Value>, message: String },
    #[error("mango query error: {error}: {reason}")]
    MangoResult { error: String, reason: String },

    #[error("replicator database not found")]
    ReplicatorAbsent,
    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    GenericCouchdbError(Value),
}
