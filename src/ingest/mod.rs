pub mod accumulator;
pub mod gateway;
pub mod record;
pub mod stats;

pub use accumulator::{AccumulatorState, BatchAccumulator, FlushError};
pub use gateway::IngestGateway;
pub use record::{parse_timestamp, MetricRecord};
pub use stats::{IngestStats, StatsSnapshot};

use crate::config::types::IngestConfig;
use crate::storage::traits::TransactionalStore;
use crate::storage::unit_of_work::UnitOfWorkCoordinator;
use crate::storage::writer::{BatchWriter, MetricsTableWriter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running ingest pipeline: the gateway callers submit through, and the
/// handle of the accumulator worker behind it.
pub struct Pipeline {
    pub gateway: IngestGateway,
    pub worker: JoinHandle<AccumulatorState>,
}

impl Pipeline {
    /// Wire queue, gateway, coordinator and table writer, and spawn the worker.
    pub fn start(
        store: Arc<dyn TransactionalStore>,
        config: &IngestConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self::start_with_writer(store, Arc::new(MetricsTableWriter::new()), config, shutdown)
    }

    pub fn start_with_writer(
        store: Arc<dyn TransactionalStore>,
        writer: Arc<dyn BatchWriter>,
        config: &IngestConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let stats = Arc::new(IngestStats::new());
        let (tx, rx) = mpsc::channel(config.buffer_limit.max(1));

        let accumulator = BatchAccumulator::new(
            UnitOfWorkCoordinator::new(store),
            writer,
            stats.clone(),
            config,
        );

        Self {
            gateway: IngestGateway::new(tx, stats),
            worker: accumulator.spawn(rx, shutdown),
        }
    }
}
