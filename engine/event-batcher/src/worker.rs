//! Worker loop: accumulate a local batch, flush on size or interval

use crate::committer::BatchCommitter;
use crate::event::EventRecord;
use crate::metrics::MetricsCollector;
use crate::queue::QueueConsumer;
use crate::store::AggregationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) struct Worker<S: AggregationStore> {
    pub(crate) id: usize,
    pub(crate) consumer: QueueConsumer,
    pub(crate) committer: Arc<BatchCommitter<S>>,
    pub(crate) batch_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) metrics: Arc<MetricsCollector>,
}

impl<S: AggregationStore> Worker<S> {
    pub(crate) async fn run(self) {
        self.metrics.workers_active.inc();
        debug!(worker = self.id, "Worker started");

        let mut batch: Vec<EventRecord> = Vec::with_capacity(self.batch_size);
        let timer = tokio::time::sleep(self.flush_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = self.consumer.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            timer.as_mut().reset(Instant::now() + self.flush_interval);
                        }
                    }
                    // Every sender is gone
                    None => break,
                },

                _ = &mut timer => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                    timer.as_mut().reset(Instant::now() + self.flush_interval);
                }
            }
        }

        self.drain(batch).await;

        self.metrics.workers_active.dec();
        info!(worker = self.id, "Worker stopped");
    }

    /// Flush what is held locally, then keep pulling until the queue is closed and empty
    async fn drain(&self, mut batch: Vec<EventRecord>) {
        self.flush(&mut batch).await;

        while let Some(record) = self.consumer.recv().await {
            batch.push(record);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }

        self.flush(&mut batch).await;
    }

    async fn flush(&self, batch: &mut Vec<EventRecord>) {
        if batch.is_empty() {
            return;
        }

        let events = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        debug!(worker = self.id, events = events.len(), "Flushing batch");
        self.committer.commit(events).await;
    }
}
