//! Error types for the event batcher

use thiserror::Error;
use uuid::Uuid;

/// Result type for batcher operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Outcome-level errors delivered to the caller that submitted an event.
///
/// Per-event variants only ever describe the event they are attached to.
/// Batch-wide variants (`Transaction`, `ProjectUpdate`, `Commit`) are copied
/// onto every event of the affected batch, which is why the type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Event queue saturated: not accepted within {timeout_ms}ms")]
    QueueSaturated { timeout_ms: u64 },

    #[error("Batch manager is shutting down")]
    ShuttingDown,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Metric not found: {metric_id}")]
    MetricNotFound { metric_id: Uuid },

    #[error("Metric update failed for {metric_id}: {message}")]
    Update { metric_id: Uuid, message: String },

    /// The store failed while applying this event; `transient` failures
    /// (lock conflicts, deadlocks, pool exhaustion) may succeed on retry
    #[error("Store error while applying event to {metric_id}: {message}")]
    Storage { metric_id: Uuid, message: String, transient: bool },

    #[error("Filter definitions of metric {metric_id} could not be decoded: {message}")]
    FilterDecode { metric_id: Uuid, message: String },

    #[error("Filter sub-metric update failed for {metric_id}: {message}")]
    FilterProcess { metric_id: Uuid, message: String },

    #[error("History bucket write failed for {metric_id}: {message}")]
    Insert { metric_id: Uuid, message: String },

    #[error("Monthly usage update failed for project {project_id}: {message}")]
    ProjectUpdate { project_id: Uuid, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Event finished its batch without a result")]
    UnhandledEvent,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BatchError {
    /// True for failures that were applied to every event of a batch
    pub fn is_batch_wide(&self) -> bool {
        matches!(
            self,
            BatchError::Transaction(_) | BatchError::ProjectUpdate { .. } | BatchError::Commit(_)
        )
    }

    /// True when the caller may simply retry later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BatchError::QueueSaturated { .. }
                | BatchError::ShuttingDown
                | BatchError::Transaction(_)
                | BatchError::Commit(_)
        ) || matches!(self, BatchError::Storage { transient: true, .. })
    }
}

/// Errors raised by an aggregation store implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True when retrying the same work may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                db.code().is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            }
            _ => false,
        }
    }
}

/// serialization_failure, deadlock_detected, lock_not_available, query_canceled
const TRANSIENT_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "57014"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_wide_classification() {
        assert!(BatchError::Commit("boom".into()).is_batch_wide());
        assert!(BatchError::Transaction("no tx".into()).is_batch_wide());
        assert!(BatchError::ProjectUpdate { project_id: Uuid::nil(), message: "gone".into() }
            .is_batch_wide());
        assert!(!BatchError::MetricNotFound { metric_id: Uuid::nil() }.is_batch_wide());
        assert!(!BatchError::QueueSaturated { timeout_ms: 5 }.is_batch_wide());
    }

    #[test]
    fn test_transient_classification() {
        assert!(BatchError::QueueSaturated { timeout_ms: 5000 }.is_transient());
        assert!(BatchError::ShuttingDown.is_transient());
        assert!(!BatchError::InvalidEvent("negative add".into()).is_transient());
        assert!(!BatchError::UnhandledEvent.is_transient());

        let storage = |transient| BatchError::Storage {
            metric_id: Uuid::nil(),
            message: "deadlock detected".into(),
            transient,
        };
        assert!(storage(true).is_transient());
        assert!(!storage(false).is_transient());
        assert!(!storage(true).is_batch_wide());
    }

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::unavailable("pool exhausted").is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::corrupt("bigint out of range").is_transient());
        assert!(!StoreError::not_found("metric").is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
