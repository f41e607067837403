// Configuration structures for the batch manager

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of events committed together in one transaction
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time a partial batch may wait before it is flushed
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// Default capacity of the shared intake queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default time a producer waits for queue space before failing
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5000;

/// Default width of a history bucket
pub const DEFAULT_HISTORY_BUCKET_SECS: u64 = 60;

/// Widest history bucket accepted (one week)
pub const MAX_HISTORY_BUCKET_SECS: u64 = 7 * 24 * 60 * 60;

/// Main configuration for the BatchManager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatcherConfig {
    /// Flush as soon as a worker holds this many events
    pub batch_size: usize,

    /// Flush a non-empty partial batch after this long
    pub flush_interval_ms: u64,

    /// Capacity of the bounded intake queue
    pub queue_capacity: usize,

    /// How long `submit` waits for queue space
    pub enqueue_timeout_ms: u64,

    /// Number of worker tasks pulling from the queue
    pub worker_count: usize,

    /// Width of the time window a history row aggregates
    pub history_bucket_secs: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
            worker_count: num_cpus::get(),
            history_bucket_secs: DEFAULT_HISTORY_BUCKET_SECS,
        }
    }
}

impl BatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn history_bucket(&self) -> chrono::Duration {
        // validate() rejects wider buckets; clamp so this never panics
        let secs = self.history_bucket_secs.min(MAX_HISTORY_BUCKET_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".to_string());
        }

        if self.flush_interval_ms == 0 {
            return Err("flush_interval_ms must be greater than 0".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".to_string());
        }

        if self.history_bucket_secs == 0 || self.history_bucket_secs > MAX_HISTORY_BUCKET_SECS {
            return Err(format!(
                "history_bucket_secs must be between 1 and {} (got {})",
                MAX_HISTORY_BUCKET_SECS, self.history_bucket_secs
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatcherConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.flush_interval(), Duration::from_millis(1000));
        assert_eq!(config.enqueue_timeout(), Duration::from_secs(5));
        assert_eq!(config.history_bucket(), chrono::Duration::seconds(60));
        assert_eq!(config.worker_count, num_cpus::get());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = BatcherConfig { batch_size: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = BatcherConfig { worker_count: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = BatcherConfig { history_bucket_secs: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_history_bucket() {
        let config = BatcherConfig { history_bucket_secs: 1 << 62, ..Default::default() };
        assert!(config.validate().is_err());
        // Still safe to call on an unvalidated config
        let max = MAX_HISTORY_BUCKET_SECS as i64;
        assert_eq!(config.history_bucket(), chrono::Duration::seconds(max));

        let config =
            BatcherConfig { history_bucket_secs: MAX_HISTORY_BUCKET_SECS, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_history_bucket_fails_start() {
        let store = std::sync::Arc::new(crate::store::MemoryAggregationStore::new());
        let config = BatcherConfig { history_bucket_secs: u64::MAX, ..Default::default() };
        let started = crate::BatchManager::start(config, store);
        assert!(matches!(started, Err(crate::BatchError::Config(_))));
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: BatcherConfig =
            serde_json::from_str(r#"{"batch_size": 7, "flush_interval_ms": 25}"#).unwrap();
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.flush_interval(), Duration::from_millis(25));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }
}
