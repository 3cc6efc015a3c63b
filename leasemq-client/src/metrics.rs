//! Metrics collection for the LeaseMQ consumer
//!
//! Every [`crate::Consumer`] owns its own [`ClientMetrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Consumer metrics collector
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Fetch metrics
    pub records_consumed: AtomicU64,
    pub bytes_consumed: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub fetch_latency_sum: AtomicU64,
    pub fetch_latency_count: AtomicU64,
    pub checksum_mismatches: AtomicU64,
    pub filtered_out: AtomicU64,

    // Confirm metrics
    pub confirms: AtomicU64,
    pub confirm_timeouts: AtomicU64,

    // Rebalance metrics
    pub partitions_evicted: AtomicU64,
    pub rebalance_events: AtomicU64,
    pub broker_register_failures: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful fetch
    pub fn record_fetch(&self, record_count: u64, byte_count: u64, latency: Duration) {
        self.records_consumed
            .fetch_add(record_count, Ordering::Relaxed);
        self.bytes_consumed.fetch_add(byte_count, Ordering::Relaxed);
        self.fetch_latency_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.fetch_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed fetch (transport or server code)
    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record messages dropped while decoding
    pub fn record_dropped(&self, checksum_mismatches: u64, filtered_out: u64) {
        self.checksum_mismatches
            .fetch_add(checksum_mismatches, Ordering::Relaxed);
        self.filtered_out.fetch_add(filtered_out, Ordering::Relaxed);
    }

    pub fn record_confirm(&self) {
        self.confirms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirm_timeout(&self) {
        self.confirm_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.partitions_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rebalance_event(&self) {
        self.rebalance_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broker_register_failure(&self) {
        self.broker_register_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get average fetch latency in microseconds
    pub fn average_fetch_latency_us(&self) -> f64 {
        let sum = self.fetch_latency_sum.load(Ordering::Relaxed);
        let count = self.fetch_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_consumed: self.records_consumed.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            average_fetch_latency_us: self.average_fetch_latency_us(),
            checksum_mismatches: self.checksum_mismatches.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            confirms: self.confirms.load(Ordering::Relaxed),
            confirm_timeouts: self.confirm_timeouts.load(Ordering::Relaxed),
            partitions_evicted: self.partitions_evicted.load(Ordering::Relaxed),
            rebalance_events: self.rebalance_events.load(Ordering::Relaxed),
            broker_register_failures: self.broker_register_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub records_consumed: u64,
    pub bytes_consumed: u64,
    pub fetch_errors: u64,
    pub average_fetch_latency_us: f64,
    pub checksum_mismatches: u64,
    pub filtered_out: u64,
    pub confirms: u64,
    pub confirm_timeouts: u64,
    pub partitions_evicted: u64,
    pub rebalance_events: u64,
    pub broker_register_failures: u64,
}

/// Timing helper for measuring operation latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(self) -> Duration {
        self.start.elapsed()
    }
}
