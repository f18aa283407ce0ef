//! Cache Engine
//!
//! Wires the tiered cache, analyzer, invalidation manager and monitoring
//! around one backing store, and owns the lifecycle of the background loops.
//!
//! ```text
//!                        CacheEngine
//!   ┌──────────────┬───────────────┬──────────────────┬──────────────┐
//!   │ TieredCache  │ UsageAnalyzer │ InvalidationMgr  │ Collector    │
//!   │ (put/get)    │ (analysis     │ (pattern/event/  │ (metrics     │
//!   │              │  loop)        │  version/age)    │  loop)       │
//!   └──────┬───────┴───────┬───────┴────────┬─────────┴──────┬───────┘
//!          └───────────────┴──── BackingStore ───────────────┘
//! ```
//!
//! Both loops run on children of one [`CancellationToken`]; [`CacheEngine::close`]
//! cancels it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::analyzer::{
    AnalysisReport, AnalyzerMetrics, PatternAnalysis, TtlOptimization, UsageAnalyzer,
};
use crate::cache::{AnalysisPass, CacheMetricsSnapshot, DataType, MirrorInvalidator, TieredCache};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::invalidation::{
    InvalidationManager, InvalidationRequest, StrategyContext, StrategyMetrics,
};
use crate::monitoring::{
    Alert, AlertHandler, AlertManager, AlertType, HealthCheck, HealthResponse, MetricData,
    MetricsCollector,
};
use crate::store::{BackingStore, InMemoryBackingStore};

/// Tiered cache engine
pub struct CacheEngine {
    config: EngineConfig,
    store: Arc<dyn BackingStore>,
    cache: Arc<TieredCache>,
    analyzer: Arc<UsageAnalyzer>,
    invalidation: InvalidationManager,
    alerts: Arc<AlertManager>,
    collector: Arc<MetricsCollector>,
    health: HealthCheck,
    token: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine").finish_non_exhaustive()
    }
}

impl CacheEngine {
    /// Build an engine over `store`
    pub fn new(store: Arc<dyn BackingStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(
            TieredCache::with_policies(store.clone(), config.policy_store()?)
                .with_analysis_interval(config.analysis_interval),
        );
        let analyzer = Arc::new(UsageAnalyzer::with_config(
            cache.clone(),
            config.analyzer_config(),
        ));

        let mirror: Arc<dyn MirrorInvalidator> = cache.clone();
        let invalidation = InvalidationManager::with_marker_ttl(
            StrategyContext::new(store.clone(), mirror),
            config.max_ttl,
        );
        for (pattern, max_idle) in config.invalidation.parsed_idle_thresholds()? {
            invalidation.time_based().register_pattern(&pattern, max_idle)?;
        }
        for (event, patterns) in &config.invalidation.events {
            invalidation
                .event_based()
                .register_event(event, patterns.clone())?;
        }

        let alerts = Arc::new(AlertManager::with_capacity(config.alert_capacity));
        let collector = Arc::new(MetricsCollector::new(
            store.clone(),
            cache.clone(),
            alerts.clone(),
            config.collector.clone(),
            config.memory.clone(),
            config.key_patterns.clone(),
        ));
        let max_latency = Duration::try_from_secs_f64(config.collector.max_latency_ms / 1000.0)
            .map_err(|e| Error::Config(format!("collector.max_latency_ms: {}", e)))?;
        let health = HealthCheck::new(max_latency);

        Ok(Self {
            config,
            store,
            cache,
            analyzer,
            invalidation,
            alerts,
            collector,
            health,
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Engine over a fresh in-memory store with the default configuration
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(InMemoryBackingStore::new()), EngineConfig::default())
    }

    /// Engine over a Redis backing store
    #[cfg(feature = "redis")]
    pub async fn connect_redis(url: &str, config: EngineConfig) -> Result<Self> {
        let store = crate::store::RedisBackingStore::connect(url).await?;
        Self::new(Arc::new(store), config)
    }

    /// Spawn the analysis and metrics loops.
    ///
    /// Calling it again is a no-op. Fails once the engine has been closed.
    pub fn start(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Internal("engine is closed".to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let analyzer: Arc<dyn AnalysisPass> = self.analyzer.clone();
        let analysis = tokio::spawn(
            self.cache
                .clone()
                .run_analysis_loop(analyzer, self.token.child_token()),
        );
        let metrics = tokio::spawn(self.collector.clone().run(self.token.child_token()));
        self.tasks.lock().extend([analysis, metrics]);

        info!(
            analysis_interval_secs = self.config.analysis_interval.as_secs(),
            metrics_interval_secs = self.config.collector.interval.as_secs(),
            "Cache engine started"
        );
        Ok(())
    }

    /// Cancel the background loops.
    ///
    /// Idempotent. In-flight store calls are not awaited.
    pub fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.health.set_live(false);
        info!("Cache engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close and wait for the background loops to exit
    pub async fn shutdown(&self) {
        self.close();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
    }

    // ===== Accessors =====

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn analyzer(&self) -> &Arc<UsageAnalyzer> {
        &self.analyzer
    }

    pub fn invalidation(&self) -> &InvalidationManager {
        &self.invalidation
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    // ===== Cache operations =====

    pub async fn put(&self, key: &str, value: impl Into<Bytes>, data_type: DataType) -> Result<()> {
        self.cache.put(key, value.into(), data_type).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.cache.get(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.cache.delete(key).await
    }

    pub async fn expire_existing(&self, key: &str, data_type: DataType) -> Result<bool> {
        self.cache.expire_existing(key, data_type).await
    }

    /// TTL currently applied to a data type
    pub fn policy(&self, data_type: DataType) -> Duration {
        self.cache.policy(data_type)
    }

    pub fn set_policy(&self, data_type: DataType, ttl: Duration) -> Result<()> {
        self.cache.set_policy(data_type, ttl)
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.cache.metrics_snapshot()
    }

    // ===== Invalidation =====

    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize> {
        self.invalidation.invalidate_by_pattern(pattern).await
    }

    pub async fn invalidate_by_event(&self, event: &str, key: &str) -> Result<usize> {
        self.invalidation.invalidate_by_event(event, key).await
    }

    pub async fn invalidate_by_version(&self, key: &str, version: i64) -> Result<usize> {
        self.invalidation.invalidate_by_version(key, version).await
    }

    pub async fn invalidate_by_age(&self, seconds: i64) -> Result<()> {
        self.invalidation.invalidate_by_age(seconds).await
    }

    pub async fn dispatch(&self, request: InvalidationRequest) -> Result<usize> {
        self.invalidation.dispatch(request).await
    }

    /// Remove keys idle past their registered threshold
    pub async fn sweep_idle(&self) -> Result<usize> {
        self.invalidation.time_based().sweep().await
    }

    pub fn strategy_metrics(&self) -> BTreeMap<String, StrategyMetrics> {
        self.invalidation.strategy_metrics()
    }

    // ===== Analysis =====

    /// Run one analysis cycle outside the loop
    pub async fn run_analysis(&self) -> Result<AnalysisReport> {
        self.analyzer.analyze().await
    }

    pub fn ttl_analysis(&self) -> AnalyzerMetrics {
        self.analyzer.ttl_analysis()
    }

    pub fn recommendations(&self) -> Vec<TtlOptimization> {
        self.analyzer.recommendations()
    }

    pub async fn analyze_pattern(&self, pattern: &str) -> Result<PatternAnalysis> {
        self.analyzer.analyze_pattern(pattern).await
    }

    pub async fn optimize_ttl(&self, pattern: &str) -> Result<usize> {
        self.analyzer.optimize_ttl(pattern).await
    }

    // ===== Monitoring =====

    /// Latest metrics snapshot, `None` before the first collection
    pub fn metrics(&self) -> Option<MetricData> {
        self.collector.latest()
    }

    /// Take a metrics snapshot now
    pub async fn collect_metrics(&self) -> Result<MetricData> {
        self.collector.collect().await
    }

    pub fn register_alert_handler(&self, alert_type: AlertType, handler: Arc<dyn AlertHandler>) {
        self.alerts.register_handler(alert_type, handler);
    }

    pub fn trigger_alert(&self, alert_type: AlertType, message: impl Into<String>) -> Alert {
        self.alerts.trigger_alert(alert_type, message)
    }

    /// Most recent alerts first (default 100)
    pub fn alert_history(&self, limit: Option<usize>) -> Vec<Alert> {
        self.alerts.history(limit)
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> HealthResponse {
        let memory = self.collector.memory_monitor().last();
        self.health
            .check_all(self.store.as_ref(), memory.as_ref())
            .await
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{FnAlertHandler, HealthStatus};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_put_get_delete() {
        let engine = CacheEngine::in_memory().unwrap();
        engine
            .put("config:app", "v1", DataType::Configuration)
            .await
            .unwrap();
        assert_eq!(
            engine.get("config:app").await.unwrap(),
            Some(Bytes::from("v1"))
        );
        assert!(engine.delete("config:app").await.unwrap());
        assert_eq!(engine.get("config:app").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            alert_capacity: 0,
            ..Default::default()
        };
        let store = Arc::new(InMemoryBackingStore::new());
        assert_matches!(CacheEngine::new(store, config), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_invalidation_registrations_from_config() {
        let yaml = r#"
invalidation:
  idle_thresholds:
    "session:*": 30m
  events:
    config_reloaded: ["config:*"]
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        let engine = CacheEngine::new(Arc::new(InMemoryBackingStore::new()), config).unwrap();

        assert_eq!(
            engine.invalidation().time_based().threshold_for("session:1"),
            Some(Duration::from_secs(1800))
        );

        engine
            .put("config:db", "x", DataType::Configuration)
            .await
            .unwrap();
        let removed = engine
            .invalidate_by_event("config_reloaded", "other:key")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(engine.get("config:db").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_idempotent_and_blocks_restart() {
        let engine = CacheEngine::in_memory().unwrap();
        engine.start().unwrap();
        engine.start().unwrap();
        assert_eq!(engine.tasks.lock().len(), 2);

        engine.close();
        engine.close();
        assert!(engine.is_closed());
        assert_matches!(engine.start(), Err(Error::Internal(_)));

        engine.shutdown().await;
        assert!(engine.tasks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_run_until_closed() {
        let engine = CacheEngine::in_memory().unwrap();
        engine.start().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(engine.ttl_analysis().total_analyses, 1);
        assert_eq!(engine.collector().collections(), 2);
        assert!(engine.metrics().is_some());

        engine.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(engine.ttl_analysis().total_analyses, 1);
        assert_eq!(engine.collector().collections(), 2);
    }

    #[tokio::test]
    async fn test_alert_handler_registration() {
        let engine = CacheEngine::in_memory().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.register_alert_handler(
            AlertType::HighLatency,
            Arc::new(FnAlertHandler(move |alert: Alert| {
                let _ = tx.send(alert.message);
            })),
        );

        engine.trigger_alert(AlertType::HighLatency, "slow ping");
        engine.trigger_alert(AlertType::LowHitRate, "not delivered");

        assert_eq!(rx.recv().await.unwrap(), "slow ping");
        assert_eq!(engine.alert_history(None).len(), 2);
    }

    #[tokio::test]
    async fn test_health_reflects_lifecycle() {
        let engine = CacheEngine::in_memory().unwrap();
        assert_eq!(engine.health().await.status, HealthStatus::Healthy);
        engine.close();
        assert_eq!(engine.health().await.status, HealthStatus::Unhealthy);
    }
}
