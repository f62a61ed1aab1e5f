use super::record::MetricRecord;
use super::stats::IngestStats;
use crate::config::types::IngestConfig;
use crate::storage::traits::StorageError;
use crate::storage::unit_of_work::UnitOfWorkCoordinator;
use crate::storage::writer::BatchWriter;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("flush panicked: {0}")]
    Panicked(String),

    #[error("flush timed out after {0:?}")]
    TimedOut(Duration),

    #[error("flush task join error: {0}")]
    Join(String),

    #[error("flush gate closed")]
    GateClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    BatchFull,
    Interval,
    QueueClosed,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FlushReason::BatchFull => "batch_full",
            FlushReason::Interval => "interval",
            FlushReason::QueueClosed => "queue_closed",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// Single background worker that turns the intake queue into bounded,
/// transactional batch writes.
///
/// All batch mutation happens on the task running [`BatchAccumulator::run`],
/// and each flush is awaited inside the event loop. A flush that times out
/// leaves its blocking store call running, so flushes also pass through a
/// one-permit gate: at most one unit of work is ever in flight, and a flush
/// that cannot get the gate within `flush_timeout` fails as timed out.
pub struct BatchAccumulator {
    coordinator: UnitOfWorkCoordinator,
    writer: Arc<dyn BatchWriter>,
    stats: Arc<IngestStats>,
    /// Single permit, held by whichever unit of work is running.
    flush_gate: Arc<Semaphore>,
    batch_size: usize,
    flush_interval: Duration,
    flush_timeout: Duration,
    drain_queue_on_shutdown: bool,
}

impl BatchAccumulator {
    pub fn new(
        coordinator: UnitOfWorkCoordinator,
        writer: Arc<dyn BatchWriter>,
        stats: Arc<IngestStats>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            coordinator,
            writer,
            stats,
            flush_gate: Arc::new(Semaphore::new(1)),
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            flush_timeout: config.flush_timeout,
            drain_queue_on_shutdown: config.drain_queue_on_shutdown,
        }
    }

    /// Spawn the worker on the current runtime.
    pub fn spawn(
        self,
        queue: mpsc::Receiver<MetricRecord>,
        shutdown: CancellationToken,
    ) -> JoinHandle<AccumulatorState> {
        tokio::spawn(self.run(queue, shutdown))
    }

    /// Run until shutdown is signalled or every producer is gone.
    ///
    /// Cancellation triggers at most one more flush before returning.
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<MetricRecord>,
        shutdown: CancellationToken,
    ) -> AccumulatorState {
        let mut batch: Vec<MetricRecord> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = AccumulatorState::Running;

        info!(
            batch_size = self.batch_size,
            flush_interval = ?self.flush_interval,
            flush_timeout = ?self.flush_timeout,
            "Batch accumulator started"
        );

        loop {
            match state {
                AccumulatorState::Running => {
                    tokio::select! {
                        biased;

                        _ = shutdown.cancelled() => {
                            info!(pending = batch.len(), "Shutdown signalled, draining");
                            state = AccumulatorState::Draining;
                        }

                        received = queue.recv() => {
                            match received {
                                Some(record) => {
                                    batch.push(record);
                                    if batch.len() >= self.batch_size {
                                        let full = self.take_batch(&mut batch);
                                        self.flush(full, FlushReason::BatchFull).await;
                                    }
                                }
                                None => {
                                    info!("Intake queue closed, flushing remaining metrics");
                                    if !batch.is_empty() {
                                        let rest = self.take_batch(&mut batch);
                                        self.flush(rest, FlushReason::QueueClosed).await;
                                    }
                                    state = AccumulatorState::Stopped;
                                }
                            }
                        }

                        _ = ticker.tick() => {
                            if !batch.is_empty() {
                                let due = self.take_batch(&mut batch);
                                self.flush(due, FlushReason::Interval).await;
                            }
                        }
                    }
                }
                AccumulatorState::Draining => {
                    // Refuse new submissions from here on.
                    queue.close();
                    let mut leftover = Vec::new();
                    while let Ok(record) = queue.try_recv() {
                        leftover.push(record);
                    }

                    if self.drain_queue_on_shutdown {
                        batch.extend(leftover);
                    } else if !leftover.is_empty() {
                        warn!(abandoned = leftover.len(), "Abandoning metrics still in intake queue");
                        self.stats.record_abandoned(leftover.len());
                    }

                    if !batch.is_empty() {
                        let last = self.take_batch(&mut batch);
                        self.flush(last, FlushReason::Shutdown).await;
                    }
                    state = AccumulatorState::Stopped;
                }
                AccumulatorState::Stopped => break,
            }
        }

        info!("Batch accumulator stopped");
        state
    }

    fn take_batch(&self, batch: &mut Vec<MetricRecord>) -> Vec<MetricRecord> {
        std::mem::replace(batch, Vec::with_capacity(self.batch_size))
    }

    /// Flush one batch. Failures are logged and counted; the batch is gone
    /// either way.
    async fn flush(&self, batch: Vec<MetricRecord>, reason: FlushReason) {
        let flush_id = Uuid::new_v4();
        let count = batch.len();
        debug!(%flush_id, count, %reason, "Flushing batch");

        match self.write(batch).await {
            Ok(()) => {
                self.stats.record_flush(count);
                if reason == FlushReason::Shutdown || reason == FlushReason::QueueClosed {
                    info!(%flush_id, count, %reason, "Final batch committed");
                } else {
                    debug!(%flush_id, count, %reason, "Batch committed");
                }
            }
            Err(e) => {
                self.stats.record_failed_flush(count);
                error!(%flush_id, count, %reason, error = %e, "Flush failed, batch discarded");
            }
        }
    }

    async fn write(&self, batch: Vec<MetricRecord>) -> Result<(), FlushError> {
        let deadline = std::time::Instant::now() + self.flush_timeout;

        match tokio::time::timeout(self.flush_timeout, self.write_exclusive(batch, deadline)).await {
            Ok(result) => result,
            // An abandoned blocking call keeps the flush gate until it returns,
            // and its deadline check stops it from committing.
            Err(_) => Err(FlushError::TimedOut(self.flush_timeout)),
        }
    }

    /// Run one unit of work while holding the flush gate. The permit moves
    /// into the blocking task, so it is released only when the store call
    /// actually returns, not when the caller stops waiting.
    async fn write_exclusive(
        &self,
        batch: Vec<MetricRecord>,
        deadline: std::time::Instant,
    ) -> Result<(), FlushError> {
        let permit = self
            .flush_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FlushError::GateClosed)?;
        let coordinator = self.coordinator.clone();
        let writer = self.writer.clone();

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            coordinator.run(Some(deadline), |ctx| writer.write_batch(ctx, &batch))
        });

        match task.await {
            Ok(result) => result.map_err(FlushError::from),
            Err(join_err) if join_err.is_panic() => {
                Err(FlushError::Panicked(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(FlushError::Join(join_err.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::gateway::IngestGateway;
    use crate::storage::duckdb::DuckDbStorage;
    use crate::storage::traits::Storage;
    use crate::storage::unit_of_work::WorkContext;
    use crate::storage::writer::MetricsTableWriter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Wraps the table writer and remembers the values of every batch it was asked to write.
    #[derive(Default)]
    struct RecordingWriter {
        inner: MetricsTableWriter,
        batches: Mutex<Vec<Vec<i64>>>,
        fail_first: usize,
        panic_first: usize,
        delay: Option<Duration>,
        /// Only the first N calls are delayed; 0 delays every call.
        slow_first: usize,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl RecordingWriter {
        fn batches(&self) -> Vec<Vec<i64>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl BatchWriter for RecordingWriter {
        fn write_batch(&self, ctx: &mut WorkContext<'_>, batch: &[MetricRecord]) -> Result<(), StorageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            let _in_flight = InFlight(&self.in_flight);
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|r| r.value).collect());

            self.inner.write_batch(ctx, batch)?;

            if let Some(delay) = self.delay {
                if self.slow_first == 0 || call < self.slow_first {
                    std::thread::sleep(delay);
                }
            }
            if call < self.panic_first {
                panic!("writer blew up");
            }
            if call < self.fail_first {
                return Err(StorageError::RowWrite {
                    index: 0,
                    message: "injected".to_string(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        gateway: IngestGateway,
        storage: Arc<DuckDbStorage>,
        writer: Arc<RecordingWriter>,
        stats: Arc<IngestStats>,
        shutdown: CancellationToken,
        handle: Option<JoinHandle<AccumulatorState>>,
        receiver: Option<mpsc::Receiver<MetricRecord>>,
        accumulator: Option<BatchAccumulator>,
    }

    fn config(batch_size: usize, flush_interval: Duration) -> IngestConfig {
        IngestConfig {
            buffer_limit: 100,
            batch_size,
            flush_interval,
            flush_timeout: Duration::from_secs(5),
            drain_queue_on_shutdown: false,
        }
    }

    async fn harness(config: IngestConfig, writer: RecordingWriter) -> Harness {
        let storage = Arc::new(DuckDbStorage::in_memory().unwrap());
        storage.init_schema().await.unwrap();

        let stats = Arc::new(IngestStats::new());
        let writer = Arc::new(writer);
        let (tx, rx) = mpsc::channel(config.buffer_limit);
        let accumulator = BatchAccumulator::new(
            UnitOfWorkCoordinator::new(storage.clone()),
            writer.clone(),
            stats.clone(),
            &config,
        );

        Harness {
            gateway: IngestGateway::new(tx, stats.clone()),
            storage,
            writer,
            stats,
            shutdown: CancellationToken::new(),
            handle: None,
            receiver: Some(rx),
            accumulator: Some(accumulator),
        }
    }

    impl Harness {
        fn start(&mut self) {
            let accumulator = self.accumulator.take().unwrap();
            let rx = self.receiver.take().unwrap();
            self.handle = Some(accumulator.spawn(rx, self.shutdown.clone()));
        }

        fn submit(&self, values: std::ops::Range<i64>) {
            for value in values {
                assert!(self
                    .gateway
                    .submit(MetricRecord::new("svc", "latency", value, None)));
            }
        }

        async fn stop(&mut self) -> AccumulatorState {
            self.shutdown.cancel();
            let handle = self.handle.take().unwrap();
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("accumulator did not stop")
                .unwrap()
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let mut h = harness(config(5, Duration::from_secs(3600)), RecordingWriter::default()).await;
        h.start();

        h.submit(0..5);
        let stats = h.stats.clone();
        wait_until(|| stats.snapshot().flushed_batches == 1).await;

        assert_eq!(h.writer.batches(), vec![vec![0, 1, 2, 3, 4]]);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 5);

        // Nothing pending, so shutdown flushes nothing more
        assert_eq!(h.stop().await, AccumulatorState::Stopped);
        assert_eq!(h.writer.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let mut h = harness(config(100, Duration::from_millis(100)), RecordingWriter::default()).await;
        h.start();

        h.submit(0..2);
        let stats = h.stats.clone();
        wait_until(|| stats.snapshot().flushed_batches == 1).await;

        // Several more idle ticks pass with an empty batch
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(h.writer.batches(), vec![vec![0, 1]]);

        h.stop().await;
        assert_eq!(h.writer.batches().len(), 1);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch_once() {
        let mut h = harness(config(10, Duration::from_secs(3600)), RecordingWriter::default()).await;
        h.start();

        h.submit(0..3);
        let gateway = h.gateway.clone();
        wait_until(|| gateway.queue_depth() == 0).await;

        assert_eq!(h.stop().await, AccumulatorState::Stopped);
        assert_eq!(h.writer.batches(), vec![vec![0, 1, 2]]);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 3);

        // The queue is closed once the worker has stopped
        assert!(!h.gateway.submit(MetricRecord::new("svc", "latency", 9, None)));
    }

    #[tokio::test]
    async fn test_queue_close_stops_worker() {
        let mut h = harness(config(10, Duration::from_secs(3600)), RecordingWriter::default()).await;
        h.start();

        h.submit(0..4);
        let handle = h.handle.take().unwrap();
        drop(h.gateway);

        let state = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, AccumulatorState::Stopped);
        assert_eq!(h.writer.batches(), vec![vec![0, 1, 2, 3]]);
    }

    #[tokio::test]
    async fn test_failed_flush_does_not_stop_worker() {
        let writer = RecordingWriter {
            fail_first: 1,
            ..Default::default()
        };
        let mut h = harness(config(2, Duration::from_secs(3600)), writer).await;
        h.start();

        h.submit(0..4);
        let stats = h.stats.clone();
        wait_until(|| {
            let s = stats.snapshot();
            s.failed_batches == 1 && s.flushed_batches == 1
        })
        .await;

        // First batch rolled back, second committed
        let rows = h.storage.count_metrics().await.unwrap();
        assert_eq!(rows, 2);
        assert_eq!(h.stats.snapshot().dropped_records, 2);
        assert_eq!(h.writer.batches(), vec![vec![0, 1], vec![2, 3]]);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_flush_is_contained() {
        let writer = RecordingWriter {
            panic_first: 1,
            ..Default::default()
        };
        let mut h = harness(config(2, Duration::from_secs(3600)), writer).await;
        h.start();

        h.submit(0..4);
        let stats = h.stats.clone();
        wait_until(|| {
            let s = stats.snapshot();
            s.failed_batches == 1 && s.flushed_batches == 1
        })
        .await;

        assert_eq!(h.storage.count_metrics().await.unwrap(), 2);
        assert_eq!(h.stop().await, AccumulatorState::Stopped);
    }

    #[tokio::test]
    async fn test_stuck_flush_times_out_without_committing() {
        let writer = RecordingWriter {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let mut cfg = config(2, Duration::from_secs(3600));
        cfg.flush_timeout = Duration::from_millis(50);
        let mut h = harness(cfg, writer).await;
        h.start();

        h.submit(0..2);
        let stats = h.stats.clone();
        wait_until(|| stats.snapshot().failed_batches == 1).await;

        // Shutdown is not held up by the abandoned flush
        let started = std::time::Instant::now();
        h.stop().await;
        assert!(started.elapsed() < Duration::from_millis(250));

        // Once the stuck call returns it finds its deadline gone and rolls back
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.storage.count_metrics().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_flush_blocks_the_next_unit_of_work() {
        let writer = RecordingWriter {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let mut cfg = config(2, Duration::from_secs(3600));
        cfg.flush_timeout = Duration::from_millis(50);
        let mut h = harness(cfg, writer).await;
        h.start();

        h.submit(0..8);
        let stats = h.stats.clone();
        wait_until(|| stats.snapshot().failed_batches == 4).await;

        // Let the stuck call return and roll back
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(h.writer.max_in_flight.load(Ordering::SeqCst), 1);
        // Later batches timed out waiting for the gate and never reached the writer
        assert_eq!(h.writer.batches(), vec![vec![0, 1]]);
        assert_eq!(h.stats.snapshot().dropped_records, 8);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 0);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_gate_is_released_when_stuck_call_returns() {
        let writer = RecordingWriter {
            delay: Some(Duration::from_millis(150)),
            slow_first: 1,
            ..Default::default()
        };
        let mut cfg = config(2, Duration::from_secs(3600));
        cfg.flush_timeout = Duration::from_millis(50);
        let mut h = harness(cfg, writer).await;
        h.start();

        h.submit(0..2);
        let stats = h.stats.clone();
        wait_until(|| stats.snapshot().failed_batches == 1).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.writer.in_flight.load(Ordering::SeqCst), 0);

        h.submit(2..4);
        wait_until(|| stats.snapshot().flushed_batches == 1).await;
        assert_eq!(h.writer.batches(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 2);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_queued_records_by_default() {
        let mut h = harness(config(100, Duration::from_secs(3600)), RecordingWriter::default()).await;
        h.submit(0..5);
        h.shutdown.cancel();
        h.start();

        assert_eq!(h.stop().await, AccumulatorState::Stopped);
        assert!(h.writer.batches().is_empty());
        assert_eq!(h.stats.snapshot().dropped_records, 5);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_when_enabled() {
        let mut cfg = config(100, Duration::from_secs(3600));
        cfg.drain_queue_on_shutdown = true;
        let mut h = harness(cfg, RecordingWriter::default()).await;
        h.submit(0..5);
        h.shutdown.cancel();
        h.start();

        assert_eq!(h.stop().await, AccumulatorState::Stopped);
        assert_eq!(h.writer.batches(), vec![vec![0, 1, 2, 3, 4]]);
        assert_eq!(h.storage.count_metrics().await.unwrap(), 5);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(7u32)), "unknown panic payload");
    }
}
