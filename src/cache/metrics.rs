//! Cache Metrics Collection
//!
//! Operation counters and latencies for the tiered read/write path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::data_type::DataType;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Mirror metrics
    mirror_hits: AtomicU64,
    mirror_misses: AtomicU64,
    mirror_expired: AtomicU64,

    // Backing store metrics
    store_hits: AtomicU64,
    store_misses: AtomicU64,
    store_errors: AtomicU64,

    // Mutations
    writes: AtomicU64,
    deletes: AtomicU64,
    writes_by_type: [AtomicU64; DataType::COUNT],

    // Policy updates applied through set_policy
    policy_updates: AtomicU64,

    // Operation latencies (microseconds, using exponential moving average)
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mirror_hit(&self) {
        self.mirror_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_miss(&self) {
        self.mirror_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mirror_expired(&self) {
        self.mirror_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_hit(&self) {
        self.store_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_miss(&self) {
        self.store_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, data_type: DataType) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.writes_by_type[type_index(data_type)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_update(&self) {
        self.policy_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mirror_hits(&self) -> u64 {
        self.mirror_hits.load(Ordering::Relaxed)
    }

    pub fn store_hits(&self) -> u64 {
        self.store_hits.load(Ordering::Relaxed)
    }

    pub fn store_misses(&self) -> u64 {
        self.store_misses.load(Ordering::Relaxed)
    }

    pub fn policy_updates(&self) -> u64 {
        self.policy_updates.load(Ordering::Relaxed)
    }

    /// Hits over all lookups that reached a final answer.
    ///
    /// `None` until at least one lookup has completed.
    pub fn hit_ratio(&self) -> Option<f64> {
        let hits = self.mirror_hits() + self.store_hits();
        let total = hits + self.store_misses();
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }

    // Latency tracking
    pub fn record_read_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.read_latency_us, duration);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.write_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    pub fn write_latency(&self) -> Duration {
        Duration::from_micros(self.write_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            mirror_hits: self.mirror_hits(),
            mirror_misses: self.mirror_misses.load(Ordering::Relaxed),
            mirror_expired: self.mirror_expired.load(Ordering::Relaxed),
            store_hits: self.store_hits(),
            store_misses: self.store_misses(),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            writes_by_type: DataType::ALL
                .iter()
                .map(|dt| (*dt, self.writes_by_type[type_index(*dt)].load(Ordering::Relaxed)))
                .collect(),
            policy_updates: self.policy_updates(),
            hit_ratio: self.hit_ratio().unwrap_or(0.0),
            read_latency_us: self.read_latency_us.load(Ordering::Relaxed),
            write_latency_us: self.write_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.mirror_hits.store(0, Ordering::Relaxed);
        self.mirror_misses.store(0, Ordering::Relaxed);
        self.mirror_expired.store(0, Ordering::Relaxed);
        self.store_hits.store(0, Ordering::Relaxed);
        self.store_misses.store(0, Ordering::Relaxed);
        self.store_errors.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        for counter in &self.writes_by_type {
            counter.store(0, Ordering::Relaxed);
        }
        self.policy_updates.store(0, Ordering::Relaxed);
    }
}

fn type_index(data_type: DataType) -> usize {
    DataType::ALL
        .iter()
        .position(|dt| *dt == data_type)
        .unwrap_or(0)
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsSnapshot {
    // Mirror
    pub mirror_hits: u64,
    pub mirror_misses: u64,
    pub mirror_expired: u64,

    // Backing store
    pub store_hits: u64,
    pub store_misses: u64,
    pub store_errors: u64,

    // Mutations
    pub writes: u64,
    pub deletes: u64,
    pub writes_by_type: BTreeMap<DataType, u64>,
    pub policy_updates: u64,

    // Overall
    pub hit_ratio: f64,
    pub read_latency_us: u64,
    pub write_latency_us: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), None);

        metrics.record_mirror_hit();
        metrics.record_mirror_miss();
        metrics.record_store_hit();
        metrics.record_store_miss();

        // Mirror misses that fall through to the store are not final answers
        let ratio = metrics.hit_ratio().unwrap();
        assert!((ratio - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.read_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_read_latency(Duration::from_micros(200));
        let latency = metrics.read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_writes_by_type() {
        let metrics = CacheMetrics::new();
        metrics.record_write(DataType::UserSessions);
        metrics.record_write(DataType::UserSessions);
        metrics.record_write(DataType::Statistics);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 3);
        assert_eq!(snapshot.writes_by_type[&DataType::UserSessions], 2);
        assert_eq!(snapshot.writes_by_type[&DataType::Statistics], 1);
        assert_eq!(snapshot.writes_by_type[&DataType::MLModels], 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = CacheMetrics::new();
        metrics.record_policy_update();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["policy_updates"], 1);
        assert_eq!(json["writes_by_type"]["user_sessions"], 0);
    }

    #[test]
    fn test_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_mirror_hit();
        metrics.record_store_miss();
        metrics.record_write(DataType::MLModels);

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.mirror_hits, 0);
        assert_eq!(snapshot.store_misses, 0);
        assert_eq!(snapshot.writes_by_type[&DataType::MLModels], 0);
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(10));
        assert!(tracker.elapsed() >= Duration::from_millis(10));
    }
}
