use crate::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one record's metadata, the unit handed to the snapshot codec
/// by the backup pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: u64,
    pub title: Option<String>,
    pub sort: Option<String>,
    pub author_sort: Option<String>,
    pub path: Option<String>,
    pub pubdate: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub series_index: f64,
    pub publisher: Option<String>,
    pub series: Option<String>,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    pub languages: Vec<String>,
    pub identifiers: Vec<String>,
}

/// Opaque encode/decode service consumed by the backup pipeline. Swappable
/// so callers can mirror snapshots in whatever external format they need.
pub trait SnapshotCodec: Send + Sync {
    fn encode(&self, record: &BookRecord) -> Result<Vec<u8>, AppError>;
    fn decode(&self, bytes: &[u8]) -> Result<BookRecord, AppError>;
}

/// Default codec: one JSON document per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSnapshotCodec;

impl SnapshotCodec for JsonSnapshotCodec {
    fn encode(&self, record: &BookRecord) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec_pretty(record)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<BookRecord, AppError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
