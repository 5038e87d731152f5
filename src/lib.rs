//! folio is the write-path of a per-record metadata cache for book libraries,
//! kept in front of a persistent [redb](https://github.com/cberner/redb) store.
//!
//! Callers mutate one or many fields for one or many records through
//! [`FieldCache::set_field`]; the cache normalizes values, merges shared-value
//! tables without ever leaving orphan or duplicate-by-case rows, derives
//! dependent fields (`author_sort`, `sort`, `path`), invalidates composite
//! caches and marks records dirty. A background [`MetadataBackup`] worker
//! mirrors dirty records to an external snapshot format without blocking
//! writers.

pub mod backup;
pub mod cache;
pub mod codec;
pub mod composite;
pub mod dirty;
pub mod logger;
pub mod norm;
pub mod schema;
pub mod storage;
pub mod tables;
pub mod value;

pub use backup::{BackupConfig, MetadataBackup, WorkerState};
pub use cache::{CachePolicy, FieldCache, WriteOptions};
pub use codec::{BookRecord, JsonSnapshotCodec, SnapshotCodec};
pub use schema::{field_def, FieldDef, FieldShape, TokenRule, BOOK_SCHEMA};
pub use storage::Storage;
pub use tables::{ItemId, ItemTable, LinkTable, RecordId};
pub use value::{FieldInput, FieldValue, Scalar, ScalarKind, UNDEFINED_DATE};

pub use chrono;
pub use redb;

use crossbeam::channel::{RecvError, SendError};
use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("row encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recv: {0}")]
    RecvError(#[from] RecvError),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl<T> From<SendError<T>> for AppError {
    fn from(e: SendError<T>) -> Self {
        AppError::Custom(format!("send error: {}", e))
    }
}

impl<T> From<PoisonError<T>> for AppError {
    fn from(e: PoisonError<T>) -> Self {
        AppError::Custom(format!("poison error: {}", e))
    }
}
