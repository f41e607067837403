// event-batcher - batched metric-event aggregation
//
// Request handlers submit events onto a bounded queue; a pool of workers
// groups them into batches and commits each batch in one store transaction,
// answering every submitter on its own reply channel.

mod committer;
mod config;
mod error;
mod event;
mod filters;
mod history;
mod lifecycle;
mod manager;
mod metrics;
mod queue;
mod shutdown;
mod worker;

pub mod store;


pub use committer::BatchCommitter;
pub use config::{
    BatcherConfig, DEFAULT_BATCH_SIZE, DEFAULT_ENQUEUE_TIMEOUT_MS, DEFAULT_FLUSH_INTERVAL_MS,
    DEFAULT_HISTORY_BUCKET_SECS, DEFAULT_QUEUE_CAPACITY, MAX_HISTORY_BUCKET_SECS,
};
pub use error::{BatchError, Result, StoreError};
pub use event::{EventAck, EventRecord, EventRequest, EventResult, MAX_SUBMITTED_FILTERS};
pub use filters::{
    decode_filter_definitions, encode_filter_definitions, matching_filters, FilterDefinition,
    FilterDefinitions,
};
pub use history::{bucket_start, HistoryBucket, HistoryEntry};
pub use lifecycle::BatchManagerCell;
pub use manager::BatchManager;
pub use metrics::{BatcherMetrics, MetricsCollector};
pub use queue::BatchQueue;
pub use shutdown::ShutdownManager;
pub use store::{
    AggregationStore, AggregationTransaction, MemoryAggregationStore, MetricSummary, MetricType,
    PgAggregationStore, SubMetricSummary,
};
