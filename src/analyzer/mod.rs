//! TTL Usage Analyzer
//!
//! Turns noisy backing-store telemetry into per-[`DataType`] usage statistics
//! and at most one TTL recommendation per type per cycle.
//!
//! # Cycle
//!
//! 1. Read store-wide counters once (hit/miss, evictions, memory pressure)
//! 2. For each data type, sample up to `sample_size` keys matching its patterns
//!    and read remaining TTL and idle time per key
//! 3. Aggregate into [`UsageStats`] and run the rule table
//! 4. Auto-apply recommendations whose confidence reaches the threshold
//!
//! A sampling failure for one data type is recorded and the remaining types
//! are still analyzed.
//!
//! Idle time is only a proxy for access frequency. Keys read through the
//! mirror do not touch the backing store, so hot keys can look idle.

pub mod stats;

mod proptest;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cache::{AnalysisPass, DataType, TieredCache};
use crate::error::{Error, Result};
use crate::store::{BackingStore, KeyTtl, StoreInfo};

pub use stats::{
    access_frequency, evaluate_rules, ttl_utilization, AccessPattern, AnalyzerMetrics,
    AnalyzerThresholds, PatternAnalysis, RuleOutcome, TtlOptimization, UsageStats,
};

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Rule thresholds
    pub thresholds: AnalyzerThresholds,
    /// Maximum keys sampled per data type (and per pattern analysis)
    pub sample_size: usize,
    /// Minimum confidence for a recommendation to be applied automatically
    pub auto_apply_confidence: f64,
    /// Key globs enumerating each data type (configured at the engine level)
    #[serde(skip)]
    pub key_patterns: BTreeMap<DataType, Vec<String>>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            thresholds: AnalyzerThresholds::default(),
            sample_size: 100,
            auto_apply_confidence: 0.7,
            key_patterns: DataType::ALL
                .iter()
                .map(|dt| (*dt, dt.default_key_patterns()))
                .collect(),
        }
    }
}

impl AnalyzerConfig {
    /// Patterns for a data type, falling back to the built-in ones
    pub fn patterns_for(&self, data_type: DataType) -> Vec<String> {
        self.key_patterns
            .get(&data_type)
            .cloned()
            .unwrap_or_else(|| data_type.default_key_patterns())
    }
}

/// Result of one analysis cycle
#[derive(Debug)]
pub struct AnalysisReport {
    /// Stats for every data type that was sampled successfully
    pub stats: BTreeMap<DataType, UsageStats>,
    /// Recommendations produced this cycle, applied or not
    pub recommendations: Vec<TtlOptimization>,
    /// One `PartialAnalysisFailure` per data type that could not be sampled
    pub failures: Vec<Error>,
}

/// Store-wide rates shared by every data type in a cycle
#[derive(Debug, Clone, Copy)]
struct GlobalRates {
    hit_rate: f64,
    eviction_rate: f64,
}

/// Per-key sample
#[derive(Debug, Clone, Copy)]
struct KeySample {
    idle: Duration,
    remaining: Option<Duration>,
    /// TTL the key was given through the cache, if known
    granted: Option<Duration>,
}

/// TTL usage analyzer
pub struct UsageAnalyzer {
    cache: Arc<TieredCache>,
    config: AnalyzerConfig,

    // Counters
    total_analyses: AtomicU64,
    optimizations_suggested: AtomicU64,
    optimizations_applied: AtomicU64,
    partial_failures: AtomicU64,

    // Last cycle
    last_analysis: RwLock<Option<DateTime<Utc>>>,
    last_stats: RwLock<BTreeMap<DataType, UsageStats>>,
    last_recommendations: RwLock<Vec<TtlOptimization>>,
}

impl UsageAnalyzer {
    /// Create an analyzer with the default configuration
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self::with_config(cache, AnalyzerConfig::default())
    }

    /// Create an analyzer with a custom configuration
    pub fn with_config(cache: Arc<TieredCache>, config: AnalyzerConfig) -> Self {
        Self {
            cache,
            config,
            total_analyses: AtomicU64::new(0),
            optimizations_suggested: AtomicU64::new(0),
            optimizations_applied: AtomicU64::new(0),
            partial_failures: AtomicU64::new(0),
            last_analysis: RwLock::new(None),
            last_stats: RwLock::new(BTreeMap::new()),
            last_recommendations: RwLock::new(Vec::new()),
        }
    }

    /// Analyzer configuration
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn store(&self) -> &Arc<dyn BackingStore> {
        self.cache.store()
    }

    /// Run one analysis cycle
    #[instrument(skip(self))]
    pub async fn analyze(&self) -> Result<AnalysisReport> {
        let info = self.store().info().await?;
        let rates = self.global_rates(&info);
        debug!(
            hit_rate = rates.hit_rate,
            eviction_rate = rates.eviction_rate,
            "Computed global rates"
        );

        let mut report = AnalysisReport {
            stats: BTreeMap::new(),
            recommendations: Vec::new(),
            failures: Vec::new(),
        };

        for data_type in DataType::ALL {
            let usage = match self.usage_for(data_type, rates).await {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(data_type = %data_type, error = %e, "Sampling failed, skipping data type");
                    self.partial_failures.fetch_add(1, Ordering::Relaxed);
                    report.failures.push(Error::PartialAnalysisFailure {
                        data_type: data_type.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if let Some(recommendation) = self.recommend(&usage) {
                report.recommendations.push(recommendation);
            }
            report.stats.insert(data_type, usage);
        }

        self.total_analyses.fetch_add(1, Ordering::Relaxed);
        *self.last_analysis.write() = Some(Utc::now());
        *self.last_stats.write() = report.stats.clone();
        *self.last_recommendations.write() = report.recommendations.clone();

        info!(
            sampled_types = report.stats.len(),
            recommendations = report.recommendations.len(),
            failures = report.failures.len(),
            "TTL analysis completed"
        );
        Ok(report)
    }

    /// Hit rate and eviction estimate shared by all data types
    fn global_rates(&self, info: &StoreInfo) -> GlobalRates {
        let hit_rate = info
            .hit_rate()
            .or_else(|| self.cache.metrics().hit_ratio())
            .unwrap_or(1.0);

        let observed = {
            let total = info.evicted_keys + info.key_count;
            if total == 0 {
                0.0
            } else {
                info.evicted_keys as f64 / total as f64
            }
        };
        let pressure = info
            .memory_pressure()
            .map(|p| ((p - 0.8) * 5.0).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        GlobalRates {
            hit_rate,
            eviction_rate: observed.max(pressure),
        }
    }

    async fn usage_for(&self, data_type: DataType, rates: GlobalRates) -> Result<UsageStats> {
        let patterns = self.config.patterns_for(data_type);
        let keys = self.sample_keys(&patterns).await?;
        let samples = self.sample(&keys).await?;

        if samples.is_empty() {
            return Ok(UsageStats::empty(data_type));
        }

        let policy_ttl = self.cache.policy(data_type);
        let n = samples.len() as f64;
        let average_access_time = samples.iter().map(|s| s.idle.as_secs_f64()).sum::<f64>() / n;
        let frequency = samples.iter().map(|s| access_frequency(s.idle)).sum::<f64>() / n;

        // Keys written before a policy change keep the TTL they were given
        let utilizations: Vec<f64> = samples
            .iter()
            .filter_map(|s| {
                s.remaining
                    .map(|remaining| ttl_utilization(s.granted.unwrap_or(policy_ttl), remaining))
            })
            .collect();
        let utilization = if utilizations.is_empty() {
            0.0
        } else {
            utilizations.iter().sum::<f64>() / utilizations.len() as f64
        };

        Ok(UsageStats {
            data_type,
            sampled_keys: samples.len(),
            hit_rate: rates.hit_rate,
            miss_rate: 1.0 - rates.hit_rate,
            eviction_rate: rates.eviction_rate,
            average_access_time,
            access_frequency: frequency,
            ttl_utilization: utilization,
        })
    }

    /// Distinct keys matching any pattern, capped at the sample size
    async fn sample_keys(&self, patterns: &[String]) -> Result<Vec<String>> {
        let cap = self.config.sample_size;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        for pattern in patterns {
            if keys.len() >= cap {
                break;
            }
            let batch = self.store().scan(pattern, Some(cap - keys.len())).await?;
            for key in batch {
                if keys.len() >= cap {
                    break;
                }
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Idle time and remaining TTL per key; keys that vanished are skipped
    async fn sample(&self, keys: &[String]) -> Result<Vec<KeySample>> {
        let mut samples = Vec::with_capacity(keys.len());
        for key in keys {
            let remaining = match self.store().ttl(key).await? {
                KeyTtl::Missing => continue,
                KeyTtl::Persistent => None,
                KeyTtl::Expires(d) => Some(d),
            };
            let Some(idle) = self.store().idle_time(key).await? else {
                continue;
            };
            samples.push(KeySample {
                idle,
                remaining,
                granted: self.cache.granted_ttl(key),
            });
        }
        Ok(samples)
    }

    /// Run the rule table and auto-apply when confident enough
    fn recommend(&self, usage: &UsageStats) -> Option<TtlOptimization> {
        let current = self.cache.policy(usage.data_type);
        let max_ttl = self.cache.policies().max_ttl();
        let outcome = evaluate_rules(usage, current, &self.config.thresholds, max_ttl)?;
        self.optimizations_suggested.fetch_add(1, Ordering::Relaxed);

        let mut applied = false;
        if outcome.confidence >= self.config.auto_apply_confidence {
            match self.cache.set_policy(usage.data_type, outcome.suggested_ttl) {
                Ok(()) => {
                    applied = true;
                    self.optimizations_applied.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(data_type = %usage.data_type, error = %e, "Failed to apply TTL recommendation"),
            }
        }

        info!(
            data_type = %usage.data_type,
            current_secs = current.as_secs(),
            suggested_secs = outcome.suggested_ttl.as_secs(),
            reason = outcome.reason,
            confidence = outcome.confidence,
            applied,
            "TTL recommendation"
        );

        Some(TtlOptimization {
            data_type: usage.data_type,
            current_ttl_secs: current.as_secs(),
            suggested_ttl_secs: outcome.suggested_ttl.as_secs(),
            reason: outcome.reason.to_string(),
            confidence: outcome.confidence,
            applied,
            created_at: Utc::now(),
        })
    }

    /// Last cycle's recommendations, including ones that were not applied
    pub fn recommendations(&self) -> Vec<TtlOptimization> {
        self.last_recommendations.read().clone()
    }

    /// Counters, last stats and current policies
    pub fn ttl_analysis(&self) -> AnalyzerMetrics {
        AnalyzerMetrics {
            total_analyses: self.total_analyses.load(Ordering::Relaxed),
            optimizations_suggested: self.optimizations_suggested.load(Ordering::Relaxed),
            optimizations_applied: self.optimizations_applied.load(Ordering::Relaxed),
            partial_failures: self.partial_failures.load(Ordering::Relaxed),
            last_analysis: *self.last_analysis.read(),
            usage_stats: self.last_stats.read().clone(),
            current_policies: self
                .cache
                .policies()
                .snapshot()
                .into_iter()
                .map(|(dt, ttl)| (dt, ttl.as_secs()))
                .collect(),
        }
    }

    /// Sample keys matching `pattern` and recommend a TTL for them
    #[instrument(skip(self))]
    pub async fn analyze_pattern(&self, pattern: &str) -> Result<PatternAnalysis> {
        if pattern.is_empty() {
            return Err(Error::invalid_argument("pattern must not be empty"));
        }

        let all_keys = self.store().scan(pattern, None).await?;
        let sampled: Vec<String> = all_keys
            .iter()
            .take(self.config.sample_size)
            .cloned()
            .collect();
        let samples = self.sample(&sampled).await?;

        if samples.is_empty() {
            return Ok(PatternAnalysis {
                pattern: pattern.to_string(),
                key_count: all_keys.len(),
                sampled_keys: 0,
                average_ttl_secs: 0.0,
                average_idle_secs: 0.0,
                access_pattern: None,
                recommended_ttl_secs: None,
            });
        }

        let n = samples.len() as f64;
        let average_idle_secs = samples.iter().map(|s| s.idle.as_secs_f64()).sum::<f64>() / n;
        let frequency = samples.iter().map(|s| access_frequency(s.idle)).sum::<f64>() / n;
        let remaining: Vec<f64> = samples
            .iter()
            .filter_map(|s| s.remaining.map(|d| d.as_secs_f64()))
            .collect();
        let average_ttl_secs = if remaining.is_empty() {
            0.0
        } else {
            remaining.iter().sum::<f64>() / remaining.len() as f64
        };

        let access_pattern = AccessPattern::from_frequency(frequency);
        Ok(PatternAnalysis {
            pattern: pattern.to_string(),
            key_count: all_keys.len(),
            sampled_keys: samples.len(),
            average_ttl_secs,
            average_idle_secs,
            access_pattern: Some(access_pattern),
            recommended_ttl_secs: Some(access_pattern.recommended_ttl().as_secs()),
        })
    }

    /// Apply the recommended TTL to every key matching `pattern`.
    ///
    /// Mirror copies of updated keys are dropped. Returns the number of keys
    /// whose expiry was updated.
    #[instrument(skip(self))]
    pub async fn optimize_ttl(&self, pattern: &str) -> Result<usize> {
        let analysis = self.analyze_pattern(pattern).await?;
        let Some(ttl_secs) = analysis.recommended_ttl_secs else {
            debug!("No keys matched, nothing to optimize");
            return Ok(0);
        };
        let ttl = Duration::from_secs(ttl_secs);

        let keys = self.store().scan(pattern, None).await?;
        let mut updated = 0;
        for key in &keys {
            if self.cache.expire_with(key, ttl).await? {
                updated += 1;
            }
        }

        info!(
            pattern,
            ttl_secs,
            updated,
            "Applied recommended TTL to matching keys"
        );
        Ok(updated)
    }
}

#[async_trait]
impl AnalysisPass for UsageAnalyzer {
    async fn run_pass(&self) -> Result<()> {
        self.analyze().await.map(|_| ())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackingStore;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn setup() -> (Arc<InMemoryBackingStore>, Arc<TieredCache>, UsageAnalyzer) {
        let store = Arc::new(InMemoryBackingStore::new());
        let cache = Arc::new(TieredCache::new(store.clone()));
        let analyzer = UsageAnalyzer::new(Arc::clone(&cache));
        (store, cache, analyzer)
    }

    #[tokio::test]
    async fn test_no_keys_no_recommendations() {
        let (_, _, analyzer) = setup();
        let report = analyzer.analyze().await.unwrap();

        assert!(report.recommendations.is_empty());
        assert!(report.stats.values().all(|s| s.is_empty()));
        assert_eq!(analyzer.ttl_analysis().total_analyses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_hit_rate_applied() {
        let (store, cache, analyzer) = setup();
        cache
            .put("stats:a", Bytes::from_static(b"1"), DataType::Statistics)
            .await
            .unwrap();
        // One store hit, three store misses
        store.get("stats:a").await.unwrap();
        for _ in 0..3 {
            store.get("stats:missing").await.unwrap();
        }

        let report = analyzer.analyze().await.unwrap();
        assert_eq!(report.recommendations.len(), 1);

        let rec = &report.recommendations[0];
        assert_eq!(rec.data_type, DataType::Statistics);
        assert_eq!(rec.reason, "low hit rate");
        assert!(rec.applied);
        assert_eq!(rec.suggested_ttl_secs, 86400 * 3 / 2);
        assert_eq!(
            cache.policy(DataType::Statistics),
            Duration::from_secs(129_600)
        );

        let metrics = analyzer.ttl_analysis();
        assert_eq!(metrics.optimizations_suggested, 1);
        assert_eq!(metrics.optimizations_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_confidence_listed_not_applied() {
        let (_, cache, analyzer) = setup();
        // Fresh key: utilization near zero, no store traffic so hit rate = 1.0
        cache
            .put("config:app", Bytes::from_static(b"{}"), DataType::Configuration)
            .await
            .unwrap();

        analyzer.analyze().await.unwrap();

        let recs = analyzer.recommendations();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].reason, "low utilization");
        assert!(!recs[0].applied);
        assert_eq!(cache.policy(DataType::Configuration), Duration::from_secs(1800));
        assert_eq!(analyzer.ttl_analysis().optimizations_applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_utilization_detected() {
        let (_, cache, analyzer) = setup();
        cache
            .put("model:m1", Bytes::from_static(b"w"), DataType::MLModels)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3500)).await;

        analyzer.analyze().await.unwrap();

        let metrics = analyzer.ttl_analysis();
        let stats = &metrics.usage_stats[&DataType::MLModels];
        assert_eq!(stats.sampled_keys, 1);
        assert!(stats.ttl_utilization > 0.9);
        assert_eq!(analyzer.recommendations()[0].reason, "high utilization");
    }

    #[tokio::test]
    async fn test_sample_size_cap() {
        let store = Arc::new(InMemoryBackingStore::new());
        let cache = Arc::new(TieredCache::new(store.clone()));
        let config = AnalyzerConfig {
            sample_size: 5,
            ..Default::default()
        };
        let analyzer = UsageAnalyzer::with_config(Arc::clone(&cache), config);
        for i in 0..20 {
            cache
                .put(&format!("session:{}", i), Bytes::from_static(b"s"), DataType::UserSessions)
                .await
                .unwrap();
        }

        let report = analyzer.analyze().await.unwrap();
        assert_eq!(report.stats[&DataType::UserSessions].sampled_keys, 5);
    }

    #[tokio::test]
    async fn test_eviction_rate_from_memory_pressure() {
        let store = Arc::new(InMemoryBackingStore::with_max_memory(100));
        let cache = Arc::new(TieredCache::new(store.clone()));
        let analyzer = UsageAnalyzer::new(Arc::clone(&cache));
        cache
            .put("default:big", Bytes::from(vec![0u8; 89]), DataType::DefaultValues)
            .await
            .unwrap();

        // 100 of 100 bytes used
        let report = analyzer.analyze().await.unwrap();
        let stats = &report.stats[&DataType::DefaultValues];
        assert!(stats.eviction_rate > 0.99);
        assert_eq!(report.recommendations[0].reason, "high eviction rate");
        assert!(report.recommendations[0].applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_utilization_uses_granted_ttl_after_policy_change() {
        let (_, cache, analyzer) = setup();
        cache
            .put("model:m1", Bytes::from_static(b"w"), DataType::MLModels)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3000)).await;

        // Doubling the policy must not make the old key look 92% consumed
        cache
            .set_policy(DataType::MLModels, Duration::from_secs(7200))
            .unwrap();
        let report = analyzer.analyze().await.unwrap();

        let stats = &report.stats[&DataType::MLModels];
        assert!((stats.ttl_utilization - 3000.0 / 3600.0).abs() < 1e-9);
        assert!(report
            .recommendations
            .iter()
            .all(|r| r.data_type != DataType::MLModels));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_grant_falls_back_to_policy() {
        let (store, _, analyzer) = setup();
        store
            .set_ex("config:ext", Bytes::from_static(b"{}"), Duration::from_secs(1800))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(900)).await;

        let report = analyzer.analyze().await.unwrap();
        assert_eq!(report.stats[&DataType::Configuration].ttl_utilization, 0.5);
    }

    #[tokio::test]
    async fn test_sampling_failure_isolated_to_one_type() {
        let (store, cache, analyzer) = setup();
        let keys = [
            ("default:a", DataType::DefaultValues),
            ("stats:a", DataType::Statistics),
            ("model:a", DataType::MLModels),
            ("config:a", DataType::Configuration),
            ("session:a", DataType::UserSessions),
        ];
        for (key, data_type) in keys {
            cache
                .put(key, Bytes::from_static(b"v"), data_type)
                .await
                .unwrap();
        }
        store.set_failing_prefix(Some("model:"));

        let report = analyzer.analyze().await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_matches!(
            &report.failures[0],
            Error::PartialAnalysisFailure { data_type, .. } if *data_type == DataType::MLModels.to_string()
        );
        assert_eq!(report.stats.len(), 4);
        assert!(!report.stats.contains_key(&DataType::MLModels));
        assert!(report.stats.values().all(|s| s.sampled_keys == 1));

        let metrics = analyzer.ttl_analysis();
        assert_eq!(metrics.partial_failures, 1);
        assert_eq!(metrics.total_analyses, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_cycle() {
        let (store, _, analyzer) = setup();
        store.set_available(false);
        assert!(analyzer.analyze().await.unwrap_err().is_connectivity());
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_pattern() {
        let (store, _, analyzer) = setup();
        for i in 0..3 {
            store
                .set_ex(&format!("user:{}", i), Bytes::from_static(b"u"), Duration::from_secs(600))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let analysis = analyzer.analyze_pattern("user:*").await.unwrap();
        assert_eq!(analysis.key_count, 3);
        assert_eq!(analysis.average_ttl_secs, 570.0);
        assert_eq!(analysis.average_idle_secs, 30.0);
        assert_eq!(analysis.access_pattern, Some(AccessPattern::Frequent));
        assert_eq!(analysis.recommended_ttl_secs, Some(7200));

        let empty = analyzer.analyze_pattern("nothing:*").await.unwrap();
        assert_eq!(empty.key_count, 0);
        assert_eq!(empty.recommended_ttl_secs, None);

        assert_matches!(analyzer.analyze_pattern("").await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimize_ttl() {
        let (store, cache, analyzer) = setup();
        cache
            .put("user:1", Bytes::from_static(b"a"), DataType::UserSessions)
            .await
            .unwrap();
        cache
            .put("user:2", Bytes::from_static(b"b"), DataType::UserSessions)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;

        // Idle for an hour: rare, 10 minutes
        let updated = analyzer.optimize_ttl("user:*").await.unwrap();
        assert_eq!(updated, 2);
        assert_eq!(
            store.ttl("user:1").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(600))
        );
        assert_eq!(cache.mirror_stats().entries, 0);
        assert_eq!(cache.granted_ttl("user:1"), Some(Duration::from_secs(600)));

        assert_eq!(analyzer.optimize_ttl("none:*").await.unwrap(), 0);
    }
}
