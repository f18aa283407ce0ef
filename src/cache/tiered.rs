//! Tiered Cache
//!
//! Read/write path over two tiers: the in-process [`Mirror`] and the shared
//! [`BackingStore`]. Every write is tagged with a [`DataType`] whose policy
//! decides the TTL applied to both tiers.
//!
//! # Read path
//!
//! 1. Mirror lookup (expired entries are dropped and fall through)
//! 2. Backing store lookup with remaining TTL
//! 3. On a store hit, repopulate the mirror with the remaining TTL
//!
//! # Write path
//!
//! Write-through: the backing store is written first and the mirror is only
//! populated once the store accepted the value.
//!
//! Mirror fills on both paths are conditional on the mirror's invalidation
//! generation, read before the store call. A delete or invalidation that
//! lands while the store call is in flight wins, and the fill is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::data_type::DataType;
use super::grants::GrantLog;
use super::metrics::{CacheMetrics, CacheMetricsSnapshot, LatencyTracker};
use super::mirror::{Mirror, MirrorLookup, MirrorStats};
use super::policy::PolicyStore;
use crate::error::{Error, Result};
use crate::store::{BackingStore, KeyTtl};

/// Default interval between analysis passes
pub const DEFAULT_ANALYSIS_INTERVAL: Duration = Duration::from_secs(60);

/// Capability to drop a key from the in-process mirror.
///
/// Invalidation only needs this narrow view of the cache, not the cache
/// itself.
pub trait MirrorInvalidator: Send + Sync {
    /// Remove the mirror copy of `key`, returning whether one existed
    fn invalidate_mirror(&self, key: &str) -> bool;
}

/// Cache counters the metrics collector reads.
///
/// Keeps the collector on store telemetry plus these counters instead of the
/// whole cache.
pub trait CacheTelemetry: Send + Sync {
    /// Hit ratio over completed lookups, `None` before the first one
    fn hit_ratio(&self) -> Option<f64>;

    /// Snapshot of operation counters
    fn metrics_snapshot(&self) -> CacheMetricsSnapshot;
}

/// One analysis cycle, invoked by [`TieredCache::run_analysis_loop`]
#[async_trait]
pub trait AnalysisPass: Send + Sync {
    /// Run a single analysis cycle
    async fn run_pass(&self) -> Result<()>;
}

/// Two-tier TTL cache
pub struct TieredCache {
    /// Authoritative tier
    store: Arc<dyn BackingStore>,
    /// Per-category TTLs
    policies: PolicyStore,
    /// Process-local tier
    mirror: Mirror,
    /// TTL each key was last given
    grants: GrantLog,
    /// Operation metrics
    metrics: CacheMetrics,
    /// Period of the analysis loop
    analysis_interval: Duration,
}

impl TieredCache {
    /// Create a cache with the built-in policies
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self::with_policies(store, PolicyStore::new())
    }

    /// Create a cache with explicit policies
    pub fn with_policies(store: Arc<dyn BackingStore>, policies: PolicyStore) -> Self {
        Self {
            store,
            policies,
            mirror: Mirror::new(),
            grants: GrantLog::new(),
            metrics: CacheMetrics::new(),
            analysis_interval: DEFAULT_ANALYSIS_INTERVAL,
        }
    }

    /// Override the analysis loop period
    pub fn with_analysis_interval(mut self, interval: Duration) -> Self {
        self.analysis_interval = interval;
        self
    }

    /// Backing store handle
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Policy store (read-only view)
    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    /// TTL currently configured for a data type
    pub fn policy(&self, data_type: DataType) -> Duration {
        self.policies.get(data_type)
    }

    /// Replace the TTL for a data type.
    ///
    /// Rejects a zero TTL or one above the policy store's maximum with
    /// `InvalidArgument`, leaving the prior value.
    pub fn set_policy(&self, data_type: DataType, ttl: Duration) -> Result<()> {
        let previous = self.policies.set(data_type, ttl)?;
        self.metrics.record_policy_update();
        info!(
            data_type = %data_type,
            previous_secs = previous.map(|d| d.as_secs()),
            ttl_secs = ttl.as_secs(),
            "TTL policy updated"
        );
        Ok(())
    }

    /// Write a value tagged with `data_type`
    #[instrument(skip(self, value), fields(size = value.len()))]
    pub async fn put(&self, key: &str, value: Bytes, data_type: DataType) -> Result<()> {
        validate_key(key)?;
        let ttl = self.policy(data_type);
        let tracker = LatencyTracker::start();
        let generation = self.mirror.generation();

        if let Err(e) = self.store.set_ex(key, value.clone(), ttl).await {
            self.metrics.record_error();
            warn!(error = %e, "Backing store write failed");
            return Err(e);
        }
        self.grants.record(key, ttl);
        if !self
            .mirror
            .insert_if_unchanged(key, value, Some(data_type), ttl, generation)
        {
            debug!("Key invalidated during write, mirror not populated");
        }

        self.metrics.record_write(data_type);
        self.metrics.record_write_latency(tracker.elapsed());
        debug!(ttl_secs = ttl.as_secs(), "Cached value");
        Ok(())
    }

    /// Read a value, consulting the mirror before the backing store
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        validate_key(key)?;
        let tracker = LatencyTracker::start();

        match self.mirror.get(key) {
            MirrorLookup::Hit(value) => {
                self.metrics.record_mirror_hit();
                self.metrics.record_read_latency(tracker.elapsed());
                return Ok(Some(value));
            }
            MirrorLookup::Expired => {
                self.metrics.record_mirror_expired();
                self.metrics.record_mirror_miss();
            }
            MirrorLookup::Miss => self.metrics.record_mirror_miss(),
        }

        let generation = self.mirror.generation();
        let found = match self.store.get_with_ttl(key).await {
            Ok(found) => found,
            Err(e) => {
                self.metrics.record_error();
                return Err(e);
            }
        };

        let result = match found {
            Some((value, ttl)) => {
                self.metrics.record_store_hit();
                let mirror_ttl = match ttl {
                    KeyTtl::Expires(remaining) => Some(remaining),
                    KeyTtl::Persistent => Some(self.policy(DataType::DefaultValues)),
                    KeyTtl::Missing => None,
                };
                if let Some(mirror_ttl) = mirror_ttl.filter(|d| !d.is_zero()) {
                    if !self
                        .mirror
                        .insert_if_unchanged(key, value.clone(), None, mirror_ttl, generation)
                    {
                        debug!("Key invalidated during read, mirror not repopulated");
                    }
                }
                Some(value)
            }
            None => {
                self.metrics.record_store_miss();
                None
            }
        };

        self.metrics.record_read_latency(tracker.elapsed());
        Ok(result)
    }

    /// Delete a key from both tiers, returning whether the store held it.
    ///
    /// The mirror copy is dropped even when the store call fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let result = self.store.delete(key).await;
        self.mirror.remove(key);
        self.grants.forget(key);
        self.metrics.record_delete();
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    /// Re-apply the current policy TTL to an existing key.
    ///
    /// Drops the mirror copy so the next read picks up the new expiry.
    /// Returns whether the key existed.
    #[instrument(skip(self))]
    pub async fn expire_existing(&self, key: &str, data_type: DataType) -> Result<bool> {
        let ttl = self.policy(data_type);
        self.expire_with(key, ttl).await
    }

    /// Give an existing key a new TTL.
    ///
    /// Drops the mirror copy and returns whether the key existed.
    #[instrument(skip(self))]
    pub async fn expire_with(&self, key: &str, ttl: Duration) -> Result<bool> {
        validate_key(key)?;
        let existed = self.store.expire(key, ttl).await?;
        self.mirror.remove(key);
        if existed {
            self.grants.record(key, ttl);
        }
        Ok(existed)
    }

    /// TTL `key` was last given through this cache, if still live
    pub fn granted_ttl(&self, key: &str) -> Option<Duration> {
        self.grants.granted(key)
    }

    /// Remove only the mirror copy of a key
    pub fn clear_mirror(&self, key: &str) -> bool {
        self.mirror.remove(key)
    }

    /// Operation metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Snapshot of operation metrics
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Mirror statistics
    pub fn mirror_stats(&self) -> MirrorStats {
        self.mirror.stats()
    }

    /// Run the analysis loop until `token` is cancelled.
    ///
    /// Each tick purges expired mirror entries and runs one analysis pass.
    /// Pass failures are logged and the loop continues.
    #[instrument(skip_all)]
    pub async fn run_analysis_loop(
        self: Arc<Self>,
        analyzer: Arc<dyn AnalysisPass>,
        token: CancellationToken,
    ) {
        info!(
            interval_secs = self.analysis_interval.as_secs(),
            "Starting TTL analysis loop"
        );

        let mut tick = interval_at(
            Instant::now() + self.analysis_interval,
            self.analysis_interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("TTL analysis loop shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let purged = self.mirror.purge_expired();
                    let lapsed = self.grants.purge_expired();
                    if purged + lapsed > 0 {
                        debug!(purged, lapsed, "Purged expired mirror entries and grants");
                    }

                    if let Err(e) = analyzer.run_pass().await {
                        error!("TTL analysis pass failed: {}", e);
                    }
                }
            }
        }
    }
}

impl MirrorInvalidator for TieredCache {
    fn invalidate_mirror(&self, key: &str) -> bool {
        self.grants.forget(key);
        self.clear_mirror(key)
    }
}

impl CacheTelemetry for TieredCache {
    fn hit_ratio(&self) -> Option<f64> {
        self.metrics.hit_ratio()
    }

    fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("key must not be empty"));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
