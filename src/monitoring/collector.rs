//! Metrics Collector
//!
//! Periodically snapshots backing-store telemetry into [`MetricData`], keeps
//! the latest snapshot plus a bounded history, and checks the snapshot
//! against thresholds. Every threshold alert is raised when the threshold is
//! crossed and resolved when the metric recovers.
//!
//! Per-data-type hit rates are estimated from idle times (the same access
//! frequency proxy the analyzer uses). The store only reports hits and misses
//! globally.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::alerts::{AlertManager, AlertType};
use super::memory::{MemoryConfig, MemoryMonitor, MemoryStats};
use crate::analyzer::{access_frequency, AccessPattern};
use crate::cache::{CacheMetricsSnapshot, CacheTelemetry, DataType};
use crate::config::duration_str;
use crate::error::{Error, Result};
use crate::store::{BackingStore, KeyTtl, StoreInfo};

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Collection interval
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Snapshots retained in history
    pub history_size: usize,
    /// Hit rate below which `LowHitRate` is raised
    pub min_hit_rate: f64,
    /// Round-trip latency above which `HighLatency` is raised
    pub max_latency_ms: f64,
    /// Eviction rate above which `HighEvictionRate` is raised
    pub max_eviction_rate: f64,
    /// Keys sampled per data type for TTL and idle statistics
    pub sample_size: usize,
    /// PING round trips averaged per snapshot
    pub ping_samples: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_size: 120,
            min_hit_rate: 0.8,
            max_latency_ms: 100.0,
            max_eviction_rate: 0.1,
            sample_size: 100,
            ping_samples: 3,
        }
    }
}

/// Per data type breakdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataTypeMetrics {
    /// Keys matching the type's patterns
    pub key_count: usize,
    /// Estimated hit rate (access frequency proxy)
    pub hit_rate: f64,
    /// Mean remaining TTL across sampled keys with an expiry
    pub average_ttl_secs: f64,
    /// `None` when no keys were sampled
    pub access_pattern: Option<AccessPattern>,
}

/// One metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricData {
    pub timestamp: DateTime<Utc>,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_rate: f64,
    /// Keys in the backing store
    pub cache_size: u64,
    pub memory_usage_mb: f64,
    /// Mean PING round trip
    pub average_latency_ms: f64,
    /// Store commands per second since the previous snapshot
    pub throughput: f64,
    pub memory: MemoryStats,
    pub by_data_type: BTreeMap<DataType, DataTypeMetrics>,
    /// In-process cache counters
    pub cache: CacheMetricsSnapshot,
}

impl MetricData {
    /// Render the snapshot in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> Result<String> {
        let registry = Registry::new();

        let gauges = [
            ("tiercache_hit_rate", "Backing store hit rate", self.hit_rate),
            ("tiercache_miss_rate", "Backing store miss rate", self.miss_rate),
            ("tiercache_eviction_rate", "Estimated eviction rate", self.eviction_rate),
            ("tiercache_keys", "Keys in the backing store", self.cache_size as f64),
            ("tiercache_memory_usage_mb", "Backing store memory in use", self.memory_usage_mb),
            ("tiercache_memory_usage_ratio", "Memory usage relative to the limit", self.memory.usage_ratio),
            ("tiercache_memory_peak_bytes", "Peak memory observed", self.memory.peak_bytes as f64),
            ("tiercache_memory_fragmentation_ratio", "Allocator fragmentation ratio", self.memory.fragmentation_ratio),
            ("tiercache_latency_ms", "Mean PING round trip", self.average_latency_ms),
            ("tiercache_throughput_ops", "Store commands per second", self.throughput),
            ("tiercache_mirror_hits", "Mirror hits", self.cache.mirror_hits as f64),
            ("tiercache_mirror_misses", "Mirror misses", self.cache.mirror_misses as f64),
            ("tiercache_store_hits", "Reads served by the backing store", self.cache.store_hits as f64),
            ("tiercache_store_misses", "Reads missing in the backing store", self.cache.store_misses as f64),
            ("tiercache_store_errors", "Failed backing store calls", self.cache.store_errors as f64),
            ("tiercache_policy_updates", "TTL policy updates", self.cache.policy_updates as f64),
        ];
        for (name, help, value) in gauges {
            let gauge = Gauge::new(name, help)?;
            gauge.set(value);
            registry.register(Box::new(gauge))?;
        }

        let keys = GaugeVec::new(
            Opts::new("tiercache_data_type_keys", "Keys per data type"),
            &["data_type"],
        )?;
        let hit_rate = GaugeVec::new(
            Opts::new("tiercache_data_type_hit_rate", "Estimated hit rate per data type"),
            &["data_type"],
        )?;
        let ttl = GaugeVec::new(
            Opts::new(
                "tiercache_data_type_avg_ttl_seconds",
                "Mean remaining TTL per data type",
            ),
            &["data_type"],
        )?;
        for (data_type, metrics) in &self.by_data_type {
            let label = [data_type.as_str()];
            keys.with_label_values(&label).set(metrics.key_count as f64);
            hit_rate.with_label_values(&label).set(metrics.hit_rate);
            ttl.with_label_values(&label).set(metrics.average_ttl_secs);
        }
        registry.register(Box::new(keys))?;
        registry.register(Box::new(hit_rate))?;
        registry.register(Box::new(ttl))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

/// Metrics collector
pub struct MetricsCollector {
    store: Arc<dyn BackingStore>,
    cache: Arc<dyn CacheTelemetry>,
    alerts: Arc<AlertManager>,
    memory: MemoryMonitor,
    config: CollectorConfig,
    key_patterns: BTreeMap<DataType, Vec<String>>,

    latest: RwLock<Option<MetricData>>,
    history: RwLock<VecDeque<MetricData>>,
    /// (when, total_commands) at the previous snapshot
    previous: Mutex<Option<(Instant, u64)>>,

    collections: AtomicU64,
    failures: AtomicU64,
}

impl MetricsCollector {
    pub fn new(
        store: Arc<dyn BackingStore>,
        cache: Arc<dyn CacheTelemetry>,
        alerts: Arc<AlertManager>,
        config: CollectorConfig,
        memory: MemoryConfig,
        key_patterns: BTreeMap<DataType, Vec<String>>,
    ) -> Self {
        Self {
            store,
            cache,
            memory: MemoryMonitor::new(memory, alerts.clone()),
            alerts,
            config,
            key_patterns,
            latest: RwLock::new(None),
            history: RwLock::new(VecDeque::new()),
            previous: Mutex::new(None),
            collections: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn memory_monitor(&self) -> &MemoryMonitor {
        &self.memory
    }

    fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Take one snapshot.
    ///
    /// A failed collection raises `BackendUnavailable`; the next successful
    /// one resolves it.
    #[instrument(skip(self))]
    pub async fn collect(&self) -> Result<MetricData> {
        match self.snapshot().await {
            Ok(data) => {
                self.alerts.resolve(AlertType::BackendUnavailable);
                self.check_thresholds(&data);
                self.record(data.clone());
                self.collections.fetch_add(1, Ordering::Relaxed);
                debug!(
                    hit_rate = data.hit_rate,
                    keys = data.cache_size,
                    latency_ms = data.average_latency_ms,
                    "Metrics collected"
                );
                Ok(data)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.alerts.raise_once(
                    AlertType::BackendUnavailable,
                    format!("Metrics collection failed: {}", e),
                );
                Err(e)
            }
        }
    }

    async fn snapshot(&self) -> Result<MetricData> {
        let info = self.store().info().await?;
        let average_latency_ms = self.average_latency().await?;
        let memory = self.memory.evaluate(&info);

        let mut by_data_type = BTreeMap::new();
        for data_type in DataType::ALL {
            by_data_type.insert(data_type, self.data_type_metrics(data_type).await?);
        }

        let hit_rate = info
            .hit_rate()
            .or_else(|| self.cache.hit_ratio())
            .unwrap_or(1.0);

        Ok(MetricData {
            timestamp: Utc::now(),
            hit_rate,
            miss_rate: 1.0 - hit_rate,
            eviction_rate: eviction_rate(&info),
            cache_size: info.key_count,
            memory_usage_mb: memory.used_mb,
            average_latency_ms,
            throughput: self.throughput(info.total_commands),
            memory,
            by_data_type,
            cache: self.cache.metrics_snapshot(),
        })
    }

    async fn average_latency(&self) -> Result<f64> {
        let samples = self.config.ping_samples.max(1);
        let mut total = Duration::ZERO;
        for _ in 0..samples {
            total += self.store().ping().await?;
        }
        Ok(total.as_secs_f64() * 1000.0 / samples as f64)
    }

    async fn data_type_metrics(&self, data_type: DataType) -> Result<DataTypeMetrics> {
        let patterns = self
            .key_patterns
            .get(&data_type)
            .cloned()
            .unwrap_or_else(|| data_type.default_key_patterns());

        let mut seen = HashSet::new();
        for pattern in &patterns {
            seen.extend(self.store().scan(pattern, None).await?);
        }

        let mut ttl_total = 0.0;
        let mut ttl_count = 0usize;
        let mut frequency_total = 0.0;
        let mut sampled = 0usize;
        for key in seen.iter().take(self.config.sample_size) {
            match self.store().ttl(key).await? {
                KeyTtl::Missing => continue,
                KeyTtl::Persistent => {}
                KeyTtl::Expires(remaining) => {
                    ttl_total += remaining.as_secs_f64();
                    ttl_count += 1;
                }
            }
            if let Some(idle) = self.store().idle_time(key).await? {
                frequency_total += access_frequency(idle);
                sampled += 1;
            }
        }

        let (hit_rate, access_pattern) = if sampled == 0 {
            (0.0, None)
        } else {
            let frequency = frequency_total / sampled as f64;
            (frequency, Some(AccessPattern::from_frequency(frequency)))
        };

        Ok(DataTypeMetrics {
            key_count: seen.len(),
            hit_rate,
            average_ttl_secs: if ttl_count == 0 {
                0.0
            } else {
                ttl_total / ttl_count as f64
            },
            access_pattern,
        })
    }

    fn throughput(&self, total_commands: u64) -> f64 {
        let now = Instant::now();
        let mut previous = self.previous.lock();
        let rate = match *previous {
            Some((at, commands)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    total_commands.saturating_sub(commands) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *previous = Some((now, total_commands));
        rate
    }

    fn check_thresholds(&self, data: &MetricData) {
        if data.hit_rate < self.config.min_hit_rate {
            self.alerts.raise_once(
                AlertType::LowHitRate,
                format!(
                    "Hit rate {:.1}% below {:.1}%",
                    data.hit_rate * 100.0,
                    self.config.min_hit_rate * 100.0
                ),
            );
        } else {
            self.alerts.resolve(AlertType::LowHitRate);
        }

        if data.average_latency_ms > self.config.max_latency_ms {
            self.alerts.raise_once(
                AlertType::HighLatency,
                format!(
                    "Average latency {:.2}ms above {:.2}ms",
                    data.average_latency_ms, self.config.max_latency_ms
                ),
            );
        } else {
            self.alerts.resolve(AlertType::HighLatency);
        }

        if data.eviction_rate > self.config.max_eviction_rate {
            self.alerts.raise_once(
                AlertType::HighEvictionRate,
                format!(
                    "Eviction rate {:.1}% above {:.1}%",
                    data.eviction_rate * 100.0,
                    self.config.max_eviction_rate * 100.0
                ),
            );
        } else {
            self.alerts.resolve(AlertType::HighEvictionRate);
        }
    }

    fn record(&self, data: MetricData) {
        let mut history = self.history.write();
        if history.len() >= self.config.history_size.max(1) {
            history.pop_front();
        }
        history.push_back(data.clone());
        *self.latest.write() = Some(data);
    }

    /// Most recent snapshot
    pub fn latest(&self) -> Option<MetricData> {
        self.latest.read().clone()
    }

    /// Retained snapshots, oldest first
    pub fn history(&self) -> Vec<MetricData> {
        self.history.read().iter().cloned().collect()
    }

    /// Successful collections
    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Failed collections
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Collect on a fixed interval until `token` is cancelled
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting metrics collection loop"
        );

        let mut tick = interval_at(Instant::now() + self.config.interval, self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Metrics collection loop shutting down");
                    break;
                }

                _ = tick.tick() => {
                    if let Err(e) = self.collect().await {
                        if e.is_connectivity() {
                            warn!("Backing store unreachable during metrics collection: {}", e);
                        } else {
                            error!("Metrics collection failed: {}", e);
                        }
                    }
                }
            }
        }
    }
}

fn eviction_rate(info: &StoreInfo) -> f64 {
    let total = info.evicted_keys + info.key_count;
    if total == 0 {
        0.0
    } else {
        info.evicted_keys as f64 / total as f64
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheMetrics, TieredCache};
    use crate::store::InMemoryBackingStore;
    use bytes::Bytes;

    struct Fixture {
        store: Arc<InMemoryBackingStore>,
        cache: Arc<TieredCache>,
        alerts: Arc<AlertManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBackingStore::new());
        let cache = Arc::new(TieredCache::new(store.clone()));
        Fixture {
            store,
            cache,
            alerts: Arc::new(AlertManager::new()),
        }
    }

    fn collector(f: &Fixture, config: CollectorConfig) -> Arc<MetricsCollector> {
        let patterns = DataType::ALL
            .iter()
            .map(|dt| (*dt, dt.default_key_patterns()))
            .collect();
        Arc::new(MetricsCollector::new(
            f.store.clone(),
            f.cache.clone(),
            f.alerts.clone(),
            config,
            MemoryConfig::default(),
            patterns,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_breakdown() {
        let f = fixture();
        f.cache
            .put("session:1", Bytes::from_static(b"a"), DataType::UserSessions)
            .await
            .unwrap();
        f.cache
            .put("user:7", Bytes::from_static(b"b"), DataType::UserSessions)
            .await
            .unwrap();
        f.cache
            .put("stats:daily", Bytes::from_static(b"c"), DataType::Statistics)
            .await
            .unwrap();

        let collector = collector(&f, CollectorConfig::default());
        let data = collector.collect().await.unwrap();

        assert_eq!(data.cache_size, 3);
        let sessions = &data.by_data_type[&DataType::UserSessions];
        assert_eq!(sessions.key_count, 2);
        assert_eq!(sessions.access_pattern, Some(AccessPattern::Frequent));
        assert!(sessions.average_ttl_secs > 7000.0);
        assert_eq!(data.by_data_type[&DataType::Statistics].key_count, 1);
        assert_eq!(data.by_data_type[&DataType::MLModels].key_count, 0);
        assert_eq!(data.by_data_type[&DataType::MLModels].access_pattern, None);

        assert_eq!(collector.latest().unwrap().cache_size, 3);
        assert_eq!(collector.collections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_bounded() {
        let f = fixture();
        let config = CollectorConfig {
            history_size: 3,
            ..Default::default()
        };
        let collector = collector(&f, config);
        for _ in 0..5 {
            collector.collect().await.unwrap();
        }
        assert_eq!(collector.history().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_between_snapshots() {
        let f = fixture();
        let collector = collector(&f, CollectorConfig::default());

        let first = collector.collect().await.unwrap();
        assert_eq!(first.throughput, 0.0);

        for i in 0..20 {
            f.store
                .set(&format!("stats:{}", i), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let second = collector.collect().await.unwrap();
        assert!(second.throughput >= 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_hit_rate_alert_raised_and_resolved() {
        let f = fixture();
        let collector = collector(&f, CollectorConfig::default());

        for i in 0..5 {
            f.cache.get(&format!("missing:{}", i)).await.unwrap();
        }
        collector.collect().await.unwrap();
        collector.collect().await.unwrap();
        assert!(f.alerts.is_active(AlertType::LowHitRate));
        assert_eq!(f.alerts.stats().total_alerts, 1);

        f.cache
            .put("config:app", Bytes::from_static(b"v"), DataType::Configuration)
            .await
            .unwrap();
        for _ in 0..100 {
            f.store.get("config:app").await.unwrap();
        }
        collector.collect().await.unwrap();
        assert!(!f.alerts.is_active(AlertType::LowHitRate));
    }

    struct FixedTelemetry(f64);

    impl CacheTelemetry for FixedTelemetry {
        fn hit_ratio(&self) -> Option<f64> {
            Some(self.0)
        }

        fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
            CacheMetrics::new().snapshot()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_from_any_telemetry_source() {
        let store = Arc::new(InMemoryBackingStore::new());
        let collector = MetricsCollector::new(
            store,
            Arc::new(FixedTelemetry(0.25)),
            Arc::new(AlertManager::new()),
            CollectorConfig::default(),
            MemoryConfig::default(),
            BTreeMap::new(),
        );

        let data = collector.collect().await.unwrap();
        assert_eq!(data.hit_rate, 0.25);
        assert_eq!(data.miss_rate, 0.75);
        assert_eq!(data.cache.mirror_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_unavailable_alert() {
        let f = fixture();
        let collector = collector(&f, CollectorConfig::default());

        f.store.set_available(false);
        assert!(collector.collect().await.is_err());
        assert!(collector.collect().await.is_err());
        assert!(f.alerts.is_active(AlertType::BackendUnavailable));
        assert_eq!(f.alerts.len(), 1);
        assert_eq!(collector.failures(), 2);
        assert!(collector.latest().is_none());

        f.store.set_available(true);
        collector.collect().await.unwrap();
        assert!(!f.alerts.is_active(AlertType::BackendUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_loop_survives_failures() {
        let f = fixture();
        let config = CollectorConfig {
            interval: Duration::from_secs(30),
            ..Default::default()
        };
        let collector = collector(&f, config);
        let token = CancellationToken::new();
        let handle = tokio::spawn(collector.clone().run(token.clone()));

        f.store.set_available(false);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(collector.failures(), 1);

        f.store.set_available(true);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(collector.collections(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prometheus_export() {
        let f = fixture();
        f.cache
            .put("model:v1", Bytes::from_static(b"w"), DataType::MLModels)
            .await
            .unwrap();
        let collector = collector(&f, CollectorConfig::default());
        let text = collector.collect().await.unwrap().to_prometheus().unwrap();

        assert!(text.contains("tiercache_keys 1"));
        assert!(text.contains("tiercache_data_type_keys{data_type=\"ml_models\"} 1"));
        assert!(text.contains("# TYPE tiercache_hit_rate gauge"));
    }
}
