use super::traits::StorageError;
use super::unit_of_work::WorkContext;
use crate::ingest::record::MetricRecord;
use chrono::{DateTime, Utc};

const INSERT_METRIC: &str =
    "INSERT INTO metrics (time, source_name, metric_name, value) VALUES (make_timestamp(CAST(? AS BIGINT)), ?, ?, ?)";

/// Writes a batch of records through the unit of work found in the context.
///
/// Implementations never commit or roll back; the enclosing coordinator does.
pub trait BatchWriter: Send + Sync {
    fn write_batch(&self, ctx: &mut WorkContext<'_>, batch: &[MetricRecord]) -> Result<(), StorageError>;
}

/// Plain-append writer for the `metrics` table.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsTableWriter;

impl MetricsTableWriter {
    pub fn new() -> Self {
        Self
    }
}

/// Missing timestamps and the Unix epoch are replaced with the current time.
pub fn normalize_timestamp(timestamp: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match timestamp {
        Some(ts) if ts.timestamp_micros() != 0 => ts,
        _ => Utc::now(),
    }
}

impl BatchWriter for MetricsTableWriter {
    fn write_batch(&self, ctx: &mut WorkContext<'_>, batch: &[MetricRecord]) -> Result<(), StorageError> {
        let uow = ctx.unit_of_work()?;

        for (index, record) in batch.iter().enumerate() {
            let time = normalize_timestamp(record.timestamp);
            uow.exec(
                INSERT_METRIC,
                duckdb::params![
                    time.timestamp_micros(),
                    record.source_name,
                    record.metric_name,
                    record.value,
                ],
            )
            .map_err(|e| StorageError::RowWrite {
                index,
                message: e.to_string(),
            })?;
        }

        Ok(())
    }
}
