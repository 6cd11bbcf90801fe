use serde::{Deserialize, Serialize};

/// Database information, as returned by `GET <db>`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DBInfo {
    /// Database name
    pub db_name: String,
    /// An opaque string that describes the purge state of the database.
    pub purge_seq: String,
    /// An opaque string that describes the state of the database.
    pub update_seq: String,
    pub sizes: Sizes,
    pub props: Props,
    /// Number of deleted documents
    pub doc_del_count: i64,
    /// A count of the documents in the specified database.
    pub doc_count: i64,
    /// The version of the physical format used for the data when it is stored on disk.
    pub disk_format_version: i64,
    /// Set to `true` if the database compaction routine is operating on this database.
    pub compact_running: bool,
    pub cluster: Cluster,
    /// Always "0". (Returned for legacy reasons.)
    pub instance_start_time: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Cluster {
    /// Shards. The number of range partitions.
    pub q: i64,
    /// Replicas. The number of copies of every document.
    pub n: i64,
    /// Write quorum.
    pub w: i64,
    /// Read quorum.
    pub r: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Sizes {
    /// The size of the database file on disk in bytes.
    pub file: i64,
    /// The uncompressed size of database contents in bytes.
    pub external: i64,
    /// The size of live data inside the database, in bytes.
    pub active: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Props {
    /// If present and true, this indicates that the database is partitioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitioned: Option<bool>,
}

/// Design documents listing (`GET <db>/_design_docs`), shaped the same as
/// `_all_docs`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DesignDocsList {
    pub total_rows: i64,
    pub offset: i64,
    pub rows: Vec<serde_json::Value>,
}
