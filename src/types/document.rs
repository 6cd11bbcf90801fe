use bevy_reflect::Reflect;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Database response after document creation/deletion or update.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocResponse {
    /// Operation status
    pub ok: bool,
    /// Document ID
    pub id: String,
    /// Revision MVCC token
    pub rev: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetMultipleDocs {
    pub total_rows: i64,
    pub offset: i64,
    pub rows: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_seq: Option<String>,
}

/// Get document request params
#[derive(Reflect, Default, Debug)]
pub struct GetDocRequestParams {
    attachments: bool,
    att_encoding_info: bool,
    conflicts: bool,
    deleted_conflicts: bool,
    latest: bool,
    local_seq: bool,
    meta: bool,
    rev: String,
    revs: bool,
    revs_info: bool,
    deleted: bool,
}

impl GetDocRequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attachments(mut self, enable: bool) -> Self {
        self.attachments = enable;
        self
    }

    pub fn att_encoding_info(mut self, enable: bool) -> Self {
        self.att_encoding_info = enable;
        self
    }

    pub fn conflicts(mut self, enable: bool) -> Self {
        self.conflicts = enable;
        self
    }

    pub fn deleted_conflicts(mut self, enable: bool) -> Self {
        self.deleted_conflicts = enable;
        self
    }

    /// Forces retrieving the latest leaf revision, no matter what `rev` was requested.
    pub fn latest(mut self, enable: bool) -> Self {
        self.latest = enable;
        self
    }

    pub fn local_seq(mut self, enable: bool) -> Self {
        self.local_seq = enable;
        self
    }

    /// Same as specifying `conflicts`, `deleted_conflicts` and `revs_info` together.
    pub fn meta(mut self, enable: bool) -> Self {
        self.meta = enable;
        self
    }

    pub fn rev<A: Into<String>>(mut self, rev: A) -> Self {
        self.rev = rev.into();
        self
    }

    pub fn revs(mut self, enable: bool) -> Self {
        self.revs = enable;
        self
    }

    pub fn revs_info(mut self, enable: bool) -> Self {
        self.revs_info = enable;
        self
    }

    /// Fetch the document even if it has been deleted.
    pub fn deleted(mut self, enable: bool) -> Self {
        self.deleted = enable;
        self
    }
}

/// One entry of `_revs_info`: a revision and whether it is still available,
/// was deleted, or was already compacted away.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevisionEntry {
    pub rev: String,
    pub status: String,
}

/// `_revisions` as CouchDB nests it: a starting generation number and the
/// revision hashes from newest to oldest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RevisionHistory {
    pub start: i64,
    pub ids: Vec<String>,
}

/// One entry under a document's `_attachments` map.
///
/// CouchDB never tells a stub's content apart from an inline one except by
/// the `stub` flag, so both fields live on the same type rather than as an
/// enum the caller would have to match on for every read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Attachment {
    pub content_type: String,
    /// Length of the attachment in bytes.
    pub length: u64,
    /// Base64-encoded content. Present on write, and on read only when
    /// `attachments=true` was requested; absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// MD5 digest of the stored content, prefixed `md5-`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub revpos: Option<i64>,
    /// `true` when this entry is a stub referencing attachment content
    /// already stored under an earlier revision rather than inline data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stub: Option<bool>,
}

/// A typed document envelope: CouchDB's required bookkeeping fields
/// (`_id`, `_rev`, `_deleted`, `_attachments`, `_revisions`) alongside the
/// caller's own payload type, flattened onto the wire next to it.
///
/// The teacher's document types pass the whole document around as an
/// untyped `serde_json::Value`; this wraps it so callers working against a
/// known schema don't have to re-extract `_id`/`_rev` by hand on every
/// round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "_deleted", skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(
        rename = "_attachments",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub attachments: Option<std::collections::BTreeMap<String, Attachment>>,
    #[serde(rename = "_revisions", skip_serializing_if = "Option::is_none")]
    pub revisions: Option<RevisionHistory>,
    #[serde(rename = "_revs_info", skip_serializing_if = "Option::is_none")]
    pub revs_info: Option<Vec<RevisionEntry>>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Document<T> {
    pub fn new(id: impl Into<String>, body: T) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: None,
            attachments: None,
            revisions: None,
            revs_info: None,
            body,
        }
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        title: String,
    }

    #[test]
    fn flattens_body_alongside_couch_bookkeeping_fields() {
        let doc = Document::new("doc-1", Payload { title: "hello".into() }).with_rev("1-abc");
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({ "_id": "doc-1", "_rev": "1-abc", "title": "hello" })
        );
    }

    #[test]
    fn round_trips_through_deserialize() {
        let value = json!({ "_id": "doc-1", "_rev": "1-abc", "title": "hello" });
        let doc: Document<Payload> = serde_json::from_value(value).unwrap();
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.rev.as_deref(), Some("1-abc"));
        assert_eq!(doc.body, Payload { title: "hello".into() });
    }

    #[test]
    fn attachment_stub_round_trips_without_inline_data() {
        let value = json!({
            "content_type": "text/plain",
            "length": 42,
            "digest": "md5-abc",
            "revpos": 3,
            "stub": true
        });
        let attachment: Attachment = serde_json::from_value(value).unwrap();
        assert!(attachment.data.is_none());
        assert_eq!(attachment.stub, Some(true));
    }
}
