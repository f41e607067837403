//! BatchManager - owns the intake queue and the worker pool

use crate::committer::BatchCommitter;
use crate::config::BatcherConfig;
use crate::error::{BatchError, Result, StoreError};
use crate::event::{EventRecord, EventRequest, EventResult};
use crate::history::HistoryBucket;
use crate::metrics::{BatcherMetrics, MetricsCollector};
use crate::queue::BatchQueue;
use crate::shutdown::ShutdownManager;
use crate::store::{AggregationStore, MetricSummary};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Batched aggregation pipeline over one store
pub struct BatchManager<S: AggregationStore> {
    config: BatcherConfig,
    store: Arc<S>,
    queue: BatchQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    shutdown: ShutdownManager,
    metrics: Arc<MetricsCollector>,
}

impl<S: AggregationStore> BatchManager<S> {
    /// Validate `config` and spawn the worker pool. Must run inside a tokio runtime.
    pub fn start(config: BatcherConfig, store: Arc<S>) -> Result<Arc<Self>> {
        config.validate().map_err(BatchError::Config)?;

        let metrics = Arc::new(MetricsCollector::new());
        let (queue, consumer) = BatchQueue::new(config.queue_capacity, config.enqueue_timeout());
        let committer =
            Arc::new(BatchCommitter::new(store.clone(), config.history_bucket(), metrics.clone()));
        let cancel = CancellationToken::new();

        let workers = (0..config.worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    consumer: consumer.clone(),
                    committer: committer.clone(),
                    batch_size: config.batch_size,
                    flush_interval: config.flush_interval(),
                    shutdown: cancel.clone(),
                    metrics: metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = config.worker_count,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            queue_capacity = config.queue_capacity,
            "Batch manager started"
        );

        Ok(Arc::new(Self {
            config,
            store,
            queue,
            workers: Mutex::new(workers),
            cancel,
            shutdown: ShutdownManager::new(),
            metrics,
        }))
    }

    /// Record one event and wait for the outcome of the batch it lands in
    pub async fn submit_event(&self, request: EventRequest) -> EventResult {
        request.validate()?;

        let (record, receiver) = EventRecord::new(request);
        self.submit(record).await?;

        // The reply sender only drops unanswered if its worker died mid-flush
        receiver.await.unwrap_or(Err(BatchError::UnhandledEvent))
    }

    /// Enqueue a prepared record; its result arrives on the record's reply channel
    pub async fn submit(&self, record: EventRecord) -> Result<()> {
        if self.shutdown.is_shutdown_requested() {
            return Err(BatchError::ShuttingDown);
        }

        let metric_id = record.metric_id();
        match self.queue.enqueue(record).await {
            Ok(()) => {
                self.metrics.events_submitted_total.inc();
                Ok(())
            }
            Err(err) => {
                if matches!(err, BatchError::QueueSaturated { .. }) {
                    self.metrics.queue_saturated_total.inc();
                    warn!(%metric_id, depth = self.queue.depth(), "Event queue saturated");
                }
                Err(err)
            }
        }
    }

    pub async fn read_metric(
        &self,
        metric_id: Uuid,
    ) -> std::result::Result<Option<MetricSummary>, StoreError> {
        self.store.read_metric(metric_id).await
    }

    pub async fn read_history(
        &self,
        metric_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::result::Result<Vec<HistoryBucket>, StoreError> {
        self.store.read_history(metric_id, from, to).await
    }

    /// Close intake, let every worker drain, and wait for them to exit.
    ///
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        if !self.shutdown.initiate_shutdown() {
            return;
        }

        info!(pending = self.queue.depth(), "Batch manager shutting down");
        self.queue.close();
        self.shutdown.start_drain();
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for (id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!(worker = id, error = %e, "Worker terminated abnormally");
            }
        }

        self.shutdown.complete_shutdown();
        info!("Batch manager shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutdown_requested()
    }

    /// Intake is closed and workers are flushing what was already queued
    pub fn is_draining(&self) -> bool {
        self.shutdown.is_draining() && !self.shutdown.is_shutdown_completed()
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown.is_shutdown_completed()
    }

    pub fn metrics(&self) -> BatcherMetrics {
        self.metrics.snapshot()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAggregationStore, MetricType};

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store = Arc::new(MemoryAggregationStore::new());
        let config = BatcherConfig { batch_size: 0, ..Default::default() };
        assert!(matches!(BatchManager::start(config, store), Err(BatchError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_event_never_reaches_queue() {
        let store = Arc::new(MemoryAggregationStore::new());
        let manager = BatchManager::start(BatcherConfig::default(), store.clone()).unwrap();

        let request = EventRequest::new(Uuid::new_v4(), Uuid::new_v4(), -1, 0);
        let err = manager.submit_event(request).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidEvent(_)));
        assert_eq!(manager.metrics().events_submitted_total, 0);

        manager.shutdown().await;
        assert_eq!(store.begin_attempts(), 0);
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let store = Arc::new(MemoryAggregationStore::new());
        let project = store.create_project("acme").await.unwrap();
        let metric = store.create_metric(project, "logins", MetricType::Base).await.unwrap();

        let config = BatcherConfig { worker_count: 2, flush_interval_ms: 10, ..Default::default() };
        let manager = BatchManager::start(config, store.clone()).unwrap();

        let ack = manager.submit_event(EventRequest::new(metric, project, 2, 0)).await.unwrap();
        assert_eq!(ack.monthly_event_count, 1);

        let summary = manager.read_metric(metric).await.unwrap().unwrap();
        assert_eq!(summary.total, 2);

        assert!(!manager.is_draining());
        manager.shutdown().await;
        assert!(manager.is_shutdown_complete());
        assert!(!manager.is_draining());
        assert_eq!(manager.metrics().workers_active, 0);
    }
}
