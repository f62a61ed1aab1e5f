use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("failed to begin unit of work: {0}")]
    Begin(String),

    #[error("failed to commit unit of work: {0}")]
    Commit(String),

    #[error("failed to roll back unit of work: {0}")]
    Rollback(String),

    #[error("row {index} write failed: {message}")]
    RowWrite { index: usize, message: String },

    #[error("unit of work missing: writer must be run inside a unit of work")]
    MissingUnitOfWork,

    #[error("unit of work deadline exceeded")]
    DeadlineExceeded,
}

impl From<duckdb::Error> for StorageError {
    fn from(e: duckdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// A persisted metric row, as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub time: DateTime<Utc>,
    pub source_name: String,
    pub metric_name: String,
    pub value: i64,
}

/// Filter for reading stored rows back, newest first.
#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub source_name: Option<String>,
    pub metric_name: Option<String>,
    pub limit: usize,
}

/// A single transactional handle against the store.
///
/// Statements executed through `exec` become visible only after `commit`.
/// `rollback` must be harmless when the unit of work is already committed or
/// already rolled back.
pub trait UnitOfWork: Send {
    fn exec(&mut self, statement: &str, params: &[&dyn duckdb::ToSql]) -> Result<usize, StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Source of units of work. Each call to `begin` yields an independent handle.
pub trait TransactionalStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    async fn count_metrics(&self) -> Result<u64, StorageError>;

    async fn query_metrics(&self, query: MetricQuery) -> Result<Vec<MetricRow>, StorageError>;
}
