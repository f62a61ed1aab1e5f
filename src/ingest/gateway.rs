use super::record::MetricRecord;
use super::stats::IngestStats;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Public entry point: a non-blocking enqueue onto the intake queue.
///
/// Overload is an expected condition. A full queue rejects the record and
/// the record is gone; nothing is buffered elsewhere.
#[derive(Clone)]
pub struct IngestGateway {
    queue: mpsc::Sender<MetricRecord>,
    stats: Arc<IngestStats>,
}

impl IngestGateway {
    pub fn new(queue: mpsc::Sender<MetricRecord>, stats: Arc<IngestStats>) -> Self {
        Self { queue, stats }
    }

    /// Returns `true` if the record was queued, `false` if it was dropped.
    pub fn submit(&self, record: MetricRecord) -> bool {
        match self.queue.try_send(record) {
            Ok(()) => {
                self.stats.record_accepted();
                true
            }
            Err(TrySendError::Full(dropped)) => {
                self.stats.record_rejected();
                warn!(
                    source_name = %dropped.source_name,
                    metric_name = %dropped.metric_name,
                    "Intake queue full, dropping metric"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.record_rejected();
                warn!("Intake queue closed, dropping metric");
                false
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.queue.max_capacity()
    }

    /// Records currently waiting in the intake queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.max_capacity() - self.queue.capacity()
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }
}
