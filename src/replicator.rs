//! Replicator Controller (C9): submits and cancels replications against
//! `_replicator`, and polls the read-only scheduler endpoints.
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CouchError;
use crate::request::RequestBuilder;
use crate::response_gate::{gate, Gated, NotFoundPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFlags {
    pub healthy: bool,
    pub terminal: bool,
}

/// Scheduler job/document state, coerced from the server's free-form
/// `state` string. Anything unrecognized maps to `Failed` per spec.md §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Initializing,
    Running,
    Pending,
    Completed,
    Error,
    Crashing,
    Failed,
}

impl SchedulerState {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "initializing" => Self::Initializing,
            "running" => Self::Running,
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "crashing" => Self::Crashing,
            "failed" => Self::Failed,
            _ => Self::Failed,
        }
    }

    pub fn flags(self) -> StateFlags {
        match self {
            Self::Initializing | Self::Running | Self::Pending => StateFlags { healthy: true, terminal: false },
            Self::Completed => StateFlags { healthy: true, terminal: true },
            Self::Error | Self::Crashing => StateFlags { healthy: false, terminal: false },
            Self::Failed => StateFlags { healthy: false, terminal: true },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerEntry {
    pub doc_id: String,
    pub state: SchedulerState,
    pub flags: StateFlags,
    pub raw: Value,
}

/// Ensure `_replicator` exists (GET, PUT-on-404), then POST `command`.
pub async fn replicate(requests: &RequestBuilder, command: &Value) -> Result<ReplicateResult, CouchError> {
    if let Err(e) = ensure_replicator_db(requests).await {
        tracing::warn!(error = %e, "could not ensure _replicator database exists");
        return Err(CouchError::ReplicatorAbsent);
    }

    let req = requests.request(Method::POST, &["_replicator"], &[]).json(command);
    let response = req.into_inner().send().await?;
    let gated = gate(response, NotFoundPolicy::Fail, requests.dispatch()).await?;
    let bytes = collect_bytes(gated).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn ensure_replicator_db(requests: &RequestBuilder) -> Result<(), CouchError> {
    let get_req = requests.request(Method::GET, &["_replicator"], &[]);
    let response = get_req.into_inner().send().await?;
    if response.status() == StatusCode::NOT_FOUND {
        let put_req = requests.request(Method::PUT, &["_replicator"], &[]);
        let response = put_req.into_inner().send().await?;
        gate(response, NotFoundPolicy::Fail, requests.dispatch()).await?;
    } else {
        gate(response, NotFoundPolicy::Fail, requests.dispatch()).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelResult {
    pub ok: bool,
    pub reason: Option<String>,
}

/// `GET /_replicator/<docId>?revs_info=true` to discover every revision,
/// then `POST {<docId>: [rev, ...]} /_replicator/_purge`. Succeeds only if
/// the purge response's `purged` map names `docId`.
pub async fn cancel(requests: &RequestBuilder, doc_id: &str) -> Result<CancelResult, CouchError> {
    let get_req = requests.request(Method::GET, &["_replicator", doc_id], &[("revs_info", "true".to_string())]);
    let response = get_req.into_inner().send().await?;
    let gated = gate(response, NotFoundPolicy::NullIfAbsent, requests.dispatch()).await?;
    let doc = match gated {
        Gated::Absent => {
            return Ok(CancelResult { ok: false, reason: Some("replication document not found".into()) });
        }
        Gated::Body { bytes_stream } => {
            let bytes = collect_bytes_stream(bytes_stream).await?;
            serde_json::from_slice::<Value>(&bytes)?
        }
    };

    let revs: Vec<String> = doc
        .get("_revs_info")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("rev").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if revs.is_empty() {
        return Ok(CancelResult { ok: false, reason: Some("no revisions found to purge".into()) });
    }

    let mut body = serde_json::Map::new();
    body.insert(doc_id.to_string(), Value::Array(revs.into_iter().map(Value::String).collect()));

    let purge_req = requests
        .request(Method::POST, &["_replicator", "_purge"], &[])
        .json(&Value::Object(body));
    let response = purge_req.into_inner().send().await?;
    let gated = gate(response, NotFoundPolicy::Fail, requests.dispatch()).await?;
    let bytes = collect_bytes(gated).await?;
    let purge_response: Value = serde_json::from_slice(&bytes)?;

    let purged = purge_response
        .get("purged")
        .and_then(Value::as_object)
        .map(|m| m.contains_key(doc_id))
        .unwrap_or(false);

    if purged {
        Ok(CancelResult { ok: true, reason: None })
    } else {
        Ok(CancelResult { ok: false, reason: Some("purge response did not confirm this document".into()) })
    }
}

pub async fn scheduler_docs(requests: &RequestBuilder) -> Result<Vec<SchedulerEntry>, CouchError> {
    poll_scheduler(requests, "docs").await
}

pub async fn scheduler_jobs(requests: &RequestBuilder) -> Result<Vec<SchedulerEntry>, CouchError> {
    poll_scheduler(requests, "jobs").await
}

async fn poll_scheduler(requests: &RequestBuilder, kind: &str) -> Result<Vec<SchedulerEntry>, CouchError> {
    let req = requests.request(Method::GET, &["_scheduler", kind], &[]);
    let response = req.into_inner().send().await?;
    let gated = gate(response, NotFoundPolicy::Fail, requests.dispatch()).await?;
    let bytes = collect_bytes(gated).await?;
    let body: Value = serde_json::from_slice(&bytes)?;

    let entries = body
        .get(kind)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(entries
        .into_iter()
        .map(|raw| {
            let doc_id = raw.get("doc_id").and_then(Value::as_str).unwrap_or("").to_string();
            let state = raw.get("state").and_then(Value::as_str).map(SchedulerState::from_wire).unwrap_or(SchedulerState::Failed);
            SchedulerEntry { doc_id, state, flags: state.flags(), raw }
        })
        .collect())
}

async fn collect_bytes(gated: Gated) -> Result<Vec<u8>, CouchError> {
    match gated {
        Gated::Absent => Ok(Vec::new()),
        Gated::Body { bytes_stream } => collect_bytes_stream(bytes_stream).await,
    }
}

async fn collect_bytes_stream(
    mut bytes_stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
) -> Result<Vec<u8>, CouchError> {
    use futures_util::StreamExt;
    let mut out = Vec::new();
    while let Some(chunk) = bytes_stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_state_maps_to_failed() {
        assert_eq!(SchedulerState::from_wire("something_new"), SchedulerState::Failed);
    }

    #[test]
    fn state_flags_match_spec_table() {
        assert_eq!(SchedulerState::Initializing.flags(), StateFlags { healthy: true, terminal: false });
        assert_eq!(SchedulerState::Running.flags(), StateFlags { healthy: true, terminal: false });
        assert_eq!(SchedulerState::Pending.flags(), StateFlags { healthy: true, terminal: false });
        assert_eq!(SchedulerState::Completed.flags(), StateFlags { healthy: true, terminal: true });
        assert_eq!(SchedulerState::Error.flags(), StateFlags { healthy: false, terminal: false });
        assert_eq!(SchedulerState::Crashing.flags(), StateFlags { healthy: false, terminal: false });
        assert_eq!(SchedulerState::Failed.flags(), StateFlags { healthy: false, terminal: true });
    }
}
