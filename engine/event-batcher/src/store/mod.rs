//! Aggregation store seam and its implementations

mod memory;
mod postgres;

pub use memory::{MemoryAggregationStore, MemoryAggregationTransaction};
pub use postgres::{PgAggregationStore, PgAggregationTransaction};

use crate::error::StoreError;
use crate::history::{HistoryBucket, HistoryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// How a metric accepts deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Additions only
    Base,
    /// Additions and removals
    Dual,
}

impl MetricType {
    /// Code persisted in the `metric_type` column
    pub fn code(self) -> i16 {
        match self {
            MetricType::Base => 0,
            MetricType::Dual => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(MetricType::Base),
            1 => Some(MetricType::Dual),
            _ => None,
        }
    }

    pub fn accepts_removals(self) -> bool {
        matches!(self, MetricType::Dual)
    }
}

/// Metric row state returned by the same statement that applied a delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRowUpdate {
    pub metric_type: MetricType,
    /// Raw filter-definition blob, decoded by the committer
    pub filters: String,
    pub total: i64,
    pub event_count: i64,
}

/// Sub-metric row state after a filter hit was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMetricUpdate {
    pub id: Uuid,
    pub total: i64,
    pub event_count: i64,
}

/// Read model of one metric and its filter sub-metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub metric_type: MetricType,
    pub total: i64,
    pub event_count: i64,
    pub last_event_timestamp: Option<DateTime<Utc>>,
    pub sub_metrics: Vec<SubMetricSummary>,
}

impl MetricSummary {
    pub fn sub_metric(&self, category: &str, name: &str) -> Option<&SubMetricSummary> {
        self.sub_metrics.iter().find(|sub| sub.category == category && sub.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMetricSummary {
    pub id: Uuid,
    pub category: String,
    pub name: String,
    pub total: i64,
    pub event_count: i64,
}

/// One open transaction against the aggregation store.
///
/// A single savepoint is live at a time: the committer opens it before an
/// event and either releases it or rolls back to it afterwards.
#[async_trait::async_trait]
pub trait AggregationTransaction: Send {
    async fn savepoint(&mut self) -> StoreResult<()>;

    async fn release_savepoint(&mut self) -> StoreResult<()>;

    /// Undo everything since the last savepoint and discard it
    async fn rollback_to_savepoint(&mut self) -> StoreResult<()>;

    /// `total += add - remove`, `event_count += 1` on a parent metric.
    ///
    /// Returns `None` when no parent metric has this id.
    async fn apply_metric_delta(
        &mut self,
        metric_id: Uuid,
        add: i64,
        remove: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<MetricRowUpdate>>;

    /// Apply the same delta to the listed sub-metrics of `parent_id`.
    ///
    /// Only rows that exist are returned.
    async fn apply_filter_delta(
        &mut self,
        parent_id: Uuid,
        filter_ids: &[Uuid],
        add: i64,
        remove: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<SubMetricUpdate>>;

    /// Insert the bucket or increment it in place
    async fn upsert_history(&mut self, entry: &HistoryEntry) -> StoreResult<()>;

    /// Add `count` to the project's monthly usage and return the new value
    async fn increment_project_usage(
        &mut self,
        project_id: Uuid,
        count: i64,
    ) -> StoreResult<Option<i64>>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// Storage behind the batch committer and the read path
#[async_trait::async_trait]
pub trait AggregationStore: Send + Sync + 'static {
    type Tx: AggregationTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx>;

    async fn read_metric(&self, metric_id: Uuid) -> StoreResult<Option<MetricSummary>>;

    /// Buckets of one metric with `from <= bucket < to`, oldest first
    async fn read_history(
        &self,
        metric_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<HistoryBucket>>;
}
