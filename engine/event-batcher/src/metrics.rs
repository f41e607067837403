// Metrics collection for the batch manager

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector for batch manager monitoring
#[derive(Debug)]
pub struct MetricsCollector {
    // Intake metrics
    pub events_submitted_total: AtomicCounter,
    pub queue_saturated_total: AtomicCounter,

    // Outcome metrics
    pub events_committed_total: AtomicCounter,
    pub events_failed_total: AtomicCounter,
    pub unhandled_events_total: AtomicCounter,

    // Flush metrics
    pub batches_flushed_total: AtomicCounter,
    pub batches_failed_total: AtomicCounter,
    /// Microseconds from transaction begin to results delivered
    pub flush_latency: AtomicHistogram,

    // Pool metrics
    pub workers_active: AtomicGauge,
    pub uptime_start: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            events_submitted_total: AtomicCounter::new(),
            queue_saturated_total: AtomicCounter::new(),
            events_committed_total: AtomicCounter::new(),
            events_failed_total: AtomicCounter::new(),
            unhandled_events_total: AtomicCounter::new(),
            batches_flushed_total: AtomicCounter::new(),
            batches_failed_total: AtomicCounter::new(),
            // 1000 buckets of 1ms each = 1s max
            flush_latency: AtomicHistogram::with_buckets(1000, 1000),
            workers_active: AtomicGauge::new(),
            uptime_start: Instant::now(),
        }
    }

    /// Get current uptime
    pub fn uptime(&self) -> std::time::Duration {
        self.uptime_start.elapsed()
    }

    /// Health score (0-100) derived from the share of failed events
    pub fn calculate_health_score(&self) -> u64 {
        if self.unhandled_events_total.get() > 0 {
            return 0;
        }

        let committed = self.events_committed_total.get();
        let failed = self.events_failed_total.get();
        let total = committed + failed;

        let failure_rate = if total > 0 { (failed * 100) / total } else { 0 };

        if failure_rate > 10 {
            0
        } else if failure_rate > 1 {
            25
        } else if failure_rate > 0 {
            75
        } else {
            100
        }
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> BatcherMetrics {
        BatcherMetrics {
            events_submitted_total: self.events_submitted_total.get(),
            queue_saturated_total: self.queue_saturated_total.get(),
            events_committed_total: self.events_committed_total.get(),
            events_failed_total: self.events_failed_total.get(),
            unhandled_events_total: self.unhandled_events_total.get(),
            batches_flushed_total: self.batches_flushed_total.get(),
            batches_failed_total: self.batches_failed_total.get(),
            flush_latency_p50_us: self.flush_latency.percentile(50.0),
            flush_latency_p99_us: self.flush_latency.percentile(99.0),
            workers_active: self.workers_active.get(),
            health_score: self.calculate_health_score(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the batch manager metrics
#[derive(Debug, Clone, Serialize)]
pub struct BatcherMetrics {
    pub events_submitted_total: u64,
    pub queue_saturated_total: u64,
    pub events_committed_total: u64,
    pub events_failed_total: u64,
    pub unhandled_events_total: u64,
    pub batches_flushed_total: u64,
    pub batches_failed_total: u64,
    pub flush_latency_p50_us: u64,
    pub flush_latency_p99_us: u64,
    pub workers_active: u64,
    pub health_score: u64,
    pub uptime_seconds: u64,
}

/// Thread-safe atomic counter
#[derive(Debug)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe atomic gauge
#[derive(Debug)]
pub struct AtomicGauge {
    value: AtomicU64,
}

impl AtomicGauge {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Default for AtomicGauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe bucketed histogram
#[derive(Debug)]
pub struct AtomicHistogram {
    buckets: Vec<AtomicU64>,
    bucket_size: u64,
    max_value: u64,
}

impl AtomicHistogram {
    pub fn with_buckets(bucket_count: usize, bucket_size: u64) -> Self {
        let buckets = (0..bucket_count.max(1)).map(|_| AtomicU64::new(0)).collect();

        Self { buckets, bucket_size, max_value: (bucket_count.max(1) as u64) * bucket_size }
    }

    pub fn record(&self, value: u64) {
        let bucket_index = if value >= self.max_value {
            self.buckets.len() - 1
        } else {
            (value / self.bucket_size) as usize
        };

        self.buckets[bucket_index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_count(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.load(Ordering::Relaxed)).sum()
    }

    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.total_count();
        if total == 0 {
            return 0;
        }

        let target = ((total as f64 * p / 100.0) as u64).max(1);
        let mut count = 0;

        for (i, bucket) in self.buckets.iter().enumerate() {
            count += bucket.load(Ordering::Relaxed);
            if count >= target {
                return (i as u64) * self.bucket_size;
            }
        }

        self.max_value
    }
}
