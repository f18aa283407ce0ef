//! Built-in invalidation strategies

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use super::{InvalidationStrategy, KeyMetadata, StrategyContext};
use crate::cache::DEFAULT_MAX_TTL;
use crate::error::{Error, Result};
use crate::store::glob_match;

/// Prefix of persisted version markers
const VERSION_MARKER_PREFIX: &str = "__version:";

/// Key holding the persisted version marker of `key`
pub fn version_marker_key(key: &str) -> String {
    format!("{}{}", VERSION_MARKER_PREFIX, key)
}

/// Distinct keys matching any of `patterns`
async fn resolve_patterns(ctx: &StrategyContext, patterns: &[String]) -> Result<Vec<String>> {
    let mut keys = BTreeSet::new();
    for pattern in patterns {
        keys.extend(ctx.store().scan(pattern, None).await?);
    }
    Ok(keys.into_iter().collect())
}

// =============================================================================
// Time-based
// =============================================================================

/// Removes keys idle longer than the threshold of a matching pattern
pub struct TimeBasedStrategy {
    ctx: StrategyContext,
    patterns: RwLock<Vec<(String, Duration)>>,
}

impl TimeBasedStrategy {
    pub const NAME: &'static str = "time_based";

    pub fn new(ctx: StrategyContext) -> Self {
        Self {
            ctx,
            patterns: RwLock::new(Vec::new()),
        }
    }

    /// Register (or replace) the idle threshold for a glob
    pub fn register_pattern(&self, pattern: &str, max_idle: Duration) -> Result<()> {
        if pattern.is_empty() {
            return Err(Error::invalid_argument("pattern must not be empty"));
        }
        if max_idle.is_zero() {
            return Err(Error::invalid_argument("max idle age must be positive"));
        }

        let mut patterns = self.patterns.write();
        match patterns.iter_mut().find(|(p, _)| p == pattern) {
            Some(entry) => entry.1 = max_idle,
            None => patterns.push((pattern.to_string(), max_idle)),
        }
        info!(pattern, max_idle_secs = max_idle.as_secs(), "Registered idle threshold");
        Ok(())
    }

    /// Strictest threshold among patterns matching `key`
    pub fn threshold_for(&self, key: &str) -> Option<Duration> {
        self.patterns
            .read()
            .iter()
            .filter(|(pattern, _)| glob_match(pattern, key))
            .map(|(_, max_idle)| *max_idle)
            .min()
    }

    /// Invalidate idle keys across every registered pattern
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<usize> {
        let patterns: Vec<String> = self.patterns.read().iter().map(|(p, _)| p.clone()).collect();
        let keys = resolve_patterns(&self.ctx, &patterns).await?;
        self.invalidate(&keys).await
    }
}

#[async_trait]
impl InvalidationStrategy for TimeBasedStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn should_invalidate(&self, key: &str, metadata: &KeyMetadata) -> bool {
        match (self.threshold_for(key), metadata.idle_time) {
            (Some(max_idle), Some(idle)) => idle > max_idle,
            _ => false,
        }
    }

    async fn invalidate(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.threshold_for(key).is_none() {
                continue;
            }
            let metadata = KeyMetadata {
                idle_time: self.ctx.store().idle_time(key).await?,
                ..Default::default()
            };
            if self.should_invalidate(key, &metadata) && self.ctx.remove(key).await? {
                debug!(key, idle_secs = metadata.idle_time.map(|d| d.as_secs()), "Removed idle key");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// =============================================================================
// Event-based
// =============================================================================

/// Removes keys bound to a named event when it fires
pub struct EventBasedStrategy {
    ctx: StrategyContext,
    events: RwLock<HashMap<String, Vec<String>>>,
}

impl EventBasedStrategy {
    pub const NAME: &'static str = "event_based";

    pub fn new(ctx: StrategyContext) -> Self {
        Self {
            ctx,
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Bind key globs to an event, adding to any existing binding
    pub fn register_event(&self, event: &str, patterns: Vec<String>) -> Result<()> {
        if event.is_empty() {
            return Err(Error::invalid_argument("event must not be empty"));
        }
        if patterns.iter().any(|p| p.is_empty()) {
            return Err(Error::invalid_argument("pattern must not be empty"));
        }

        let mut events = self.events.write();
        let bound = events.entry(event.to_string()).or_default();
        for pattern in patterns {
            if !bound.contains(&pattern) {
                bound.push(pattern);
            }
        }
        info!(event, patterns = bound.len(), "Registered event binding");
        Ok(())
    }

    /// Patterns bound to an event
    pub fn patterns_for(&self, event: &str) -> Vec<String> {
        self.events.read().get(event).cloned().unwrap_or_default()
    }

    /// Remove every key bound to `event`; unknown events remove nothing
    #[instrument(skip(self))]
    pub async fn trigger_event(&self, event: &str) -> Result<usize> {
        let patterns = self.patterns_for(event);
        if patterns.is_empty() {
            debug!("No patterns bound to event");
            return Ok(0);
        }
        let keys = resolve_patterns(&self.ctx, &patterns).await?;
        self.invalidate(&keys).await
    }
}

#[async_trait]
impl InvalidationStrategy for EventBasedStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn should_invalidate(&self, _key: &str, _metadata: &KeyMetadata) -> bool {
        true
    }

    async fn invalidate(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.ctx.remove(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// =============================================================================
// Version-based
// =============================================================================

/// Removes keys whose persisted version marker differs from the
/// authoritative version, then rewrites the marker.
///
/// Markers expire after `marker_ttl` (the maximum policy TTL by default). An
/// expired marker reads as missing, which counts as stale.
pub struct VersionBasedStrategy {
    ctx: StrategyContext,
    versions: RwLock<HashMap<String, String>>,
    marker_ttl: Duration,
}

impl VersionBasedStrategy {
    pub const NAME: &'static str = "version_based";

    pub fn new(ctx: StrategyContext) -> Self {
        Self {
            ctx,
            versions: RwLock::new(HashMap::new()),
            marker_ttl: DEFAULT_MAX_TTL,
        }
    }

    /// Override how long persisted markers are kept
    pub fn with_marker_ttl(mut self, marker_ttl: Duration) -> Self {
        self.marker_ttl = marker_ttl;
        self
    }

    pub fn marker_ttl(&self) -> Duration {
        self.marker_ttl
    }

    /// Record the authoritative version of a key
    pub fn set_version(&self, key: &str, version: impl Into<String>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        self.versions.write().insert(key.to_string(), version.into());
        Ok(())
    }

    /// Authoritative version of a key
    pub fn version(&self, key: &str) -> Option<String> {
        self.versions.read().get(key).cloned()
    }

    async fn read_marker(&self, key: &str) -> Result<Option<String>> {
        let raw = self.ctx.store().get(&version_marker_key(key)).await?;
        Ok(raw.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[async_trait]
impl InvalidationStrategy for VersionBasedStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn should_invalidate(&self, key: &str, metadata: &KeyMetadata) -> bool {
        match self.version(key) {
            Some(current) => metadata.version_marker.as_deref() != Some(current.as_str()),
            None => false,
        }
    }

    async fn invalidate(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            let Some(current) = self.version(key) else {
                continue;
            };
            let metadata = KeyMetadata {
                version_marker: self.read_marker(key).await?,
                ..Default::default()
            };
            if !self.should_invalidate(key, &metadata) {
                continue;
            }

            if self.ctx.remove(key).await? {
                removed += 1;
            }
            self.ctx
                .store()
                .set_ex(
                    &version_marker_key(key),
                    Bytes::from(current.clone()),
                    self.marker_ttl,
                )
                .await?;
            info!(
                key,
                stale = metadata.version_marker.as_deref().unwrap_or("<none>"),
                current = %current,
                "Invalidated stale version"
            );
        }
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================
