//! Invalidation Manager
//!
//! Name-keyed registry of [`InvalidationStrategy`] implementations plus the
//! manager-level operations consumed by callers. Arguments are validated
//! before the backing store is touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::strategies::{EventBasedStrategy, TimeBasedStrategy, VersionBasedStrategy};
use super::{InvalidationRequest, InvalidationStrategy, StrategyContext};
use crate::cache::DEFAULT_MAX_TTL;
use crate::error::{Error, Result};
use crate::store::pattern::is_literal;

/// Metrics name for `invalidate_by_pattern`, which runs outside any strategy
pub const PATTERN_STRATEGY: &str = "pattern";

/// Per-strategy execution metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrategyMetrics {
    /// Invocations, successful or not
    pub executions: u64,
    /// Keys removed across all invocations
    pub keys_invalidated: u64,
    /// Invocations that returned an error
    pub failures: u64,
    /// Rolling average latency (milliseconds)
    pub average_latency_ms: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

impl StrategyMetrics {
    fn record(&mut self, outcome: &Result<usize>, elapsed: Duration) {
        self.executions += 1;
        match outcome {
            Ok(count) => self.keys_invalidated += *count as u64,
            Err(_) => self.failures += 1,
        }
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / self.executions as f64;
        self.last_execution = Some(Utc::now());
    }
}

/// Invalidation manager
pub struct InvalidationManager {
    ctx: StrategyContext,
    strategies: RwLock<HashMap<String, Arc<dyn InvalidationStrategy>>>,
    time_based: Arc<TimeBasedStrategy>,
    event_based: Arc<EventBasedStrategy>,
    version_based: Arc<VersionBasedStrategy>,
    metrics: RwLock<HashMap<String, StrategyMetrics>>,
}

impl InvalidationManager {
    /// Create a manager with the built-in strategies registered
    pub fn new(ctx: StrategyContext) -> Self {
        Self::with_marker_ttl(ctx, DEFAULT_MAX_TTL)
    }

    /// Create a manager whose version markers expire after `marker_ttl`
    pub fn with_marker_ttl(ctx: StrategyContext, marker_ttl: Duration) -> Self {
        let time_based = Arc::new(TimeBasedStrategy::new(ctx.clone()));
        let event_based = Arc::new(EventBasedStrategy::new(ctx.clone()));
        let version_based =
            Arc::new(VersionBasedStrategy::new(ctx.clone()).with_marker_ttl(marker_ttl));

        let mut strategies: HashMap<String, Arc<dyn InvalidationStrategy>> = HashMap::new();
        strategies.insert(TimeBasedStrategy::NAME.to_string(), time_based.clone());
        strategies.insert(EventBasedStrategy::NAME.to_string(), event_based.clone());
        strategies.insert(VersionBasedStrategy::NAME.to_string(), version_based.clone());

        Self {
            ctx,
            strategies: RwLock::new(strategies),
            time_based,
            event_based,
            version_based,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Built-in idle-time strategy
    pub fn time_based(&self) -> &Arc<TimeBasedStrategy> {
        &self.time_based
    }

    /// Built-in event strategy
    pub fn event_based(&self) -> &Arc<EventBasedStrategy> {
        &self.event_based
    }

    /// Built-in version strategy
    pub fn version_based(&self) -> &Arc<VersionBasedStrategy> {
        &self.version_based
    }

    /// Register a strategy under its name, returning any strategy it replaced
    pub fn register_strategy(
        &self,
        strategy: Arc<dyn InvalidationStrategy>,
    ) -> Option<Arc<dyn InvalidationStrategy>> {
        let name = strategy.name().to_string();
        info!(strategy = %name, "Registered invalidation strategy");
        self.strategies.write().insert(name, strategy)
    }

    /// Registered strategy names, sorted
    pub fn strategy_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.strategies.read().keys().cloned().collect();
        names.into_iter().collect()
    }

    /// Run a registered strategy over `keys`
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn invalidate_with(&self, name: &str, keys: &[String]) -> Result<usize> {
        let strategy = self
            .strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StrategyNotFound(name.to_string()))?;

        let start = Instant::now();
        let outcome = strategy.invalidate(keys).await;
        self.record(name, &outcome, start.elapsed());
        outcome
    }

    /// Remove every key matching `pattern` from both tiers
    #[instrument(skip(self))]
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize> {
        if pattern.is_empty() {
            return Err(Error::invalid_argument("pattern must not be empty"));
        }

        let start = Instant::now();
        let outcome = self.remove_matching(pattern).await;
        self.record(PATTERN_STRATEGY, &outcome, start.elapsed());

        if let Ok(removed) = &outcome {
            info!(removed, "Invalidated keys by pattern");
        }
        outcome
    }

    async fn remove_matching(&self, pattern: &str) -> Result<usize> {
        // A literal pattern names exactly one key, no SCAN needed
        if is_literal(pattern) {
            return Ok(usize::from(self.ctx.remove(pattern).await?));
        }

        let keys = self.ctx.store().scan(pattern, None).await?;
        let mut removed = 0;
        for key in &keys {
            if self.ctx.remove(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove `key` plus every key bound to `event`
    #[instrument(skip(self))]
    pub async fn invalidate_by_event(&self, event: &str, key: &str) -> Result<usize> {
        if event.is_empty() {
            return Err(Error::invalid_argument("event must not be empty"));
        }
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }

        let start = Instant::now();
        let outcome = async {
            let direct = usize::from(self.ctx.remove(key).await?);
            let bound = self.event_based.trigger_event(event).await?;
            Ok::<usize, Error>(direct + bound)
        }
        .await;
        self.record(EventBasedStrategy::NAME, &outcome, start.elapsed());
        outcome
    }

    /// Record `version` as authoritative for `key` and invalidate it if the
    /// persisted marker differs
    #[instrument(skip(self))]
    pub async fn invalidate_by_version(&self, key: &str, version: i64) -> Result<usize> {
        if key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        if version < 0 {
            return Err(Error::invalid_argument(format!(
                "version must not be negative, got {}",
                version
            )));
        }

        self.version_based.set_version(key, version.to_string())?;
        let start = Instant::now();
        let outcome = self.version_based.invalidate(&[key.to_string()]).await;
        self.record(VersionBasedStrategy::NAME, &outcome, start.elapsed());
        outcome
    }

    /// Invalidate keys older than `seconds`.
    ///
    /// Only the argument is validated: keys carry no write timestamp that
    /// could be queried, so nothing is removed until a timestamp-indexed key
    /// registry exists.
    #[instrument(skip(self))]
    pub async fn invalidate_by_age(&self, seconds: i64) -> Result<()> {
        if seconds < 0 {
            return Err(Error::invalid_argument(format!(
                "max age must not be negative, got {}",
                seconds
            )));
        }
        warn!("Age-based invalidation is not supported by the backing store; no keys removed");
        Ok(())
    }

    /// Route a request to the matching operation
    pub async fn dispatch(&self, request: InvalidationRequest) -> Result<usize> {
        debug!(?request, "Dispatching invalidation request");
        match request {
            InvalidationRequest::Pattern { pattern } => self.invalidate_by_pattern(&pattern).await,
            InvalidationRequest::Event { event, key } => {
                self.invalidate_by_event(&event, &key).await
            }
            InvalidationRequest::Version { key, version } => {
                self.invalidate_by_version(&key, version).await
            }
            InvalidationRequest::MaxAge { seconds } => {
                self.invalidate_by_age(seconds).await.map(|_| 0)
            }
        }
    }

    /// Execution metrics keyed by strategy name
    pub fn strategy_metrics(&self) -> BTreeMap<String, StrategyMetrics> {
        self.metrics
            .read()
            .iter()
            .map(|(name, m)| (name.clone(), m.clone()))
            .collect()
    }

    fn record(&self, name: &str, outcome: &Result<usize>, elapsed: Duration) {
        self.metrics
            .write()
            .entry(name.to_string())
            .or_default()
            .record(outcome, elapsed);
    }
}

// =============================================================================
// Tests
// =============================================================================
