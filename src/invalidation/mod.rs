//! Targeted Invalidation
//!
//! Removes keys outside normal TTL expiry. Every removal goes through
//! [`StrategyContext::remove`], which deletes the backing-store copy and then
//! drops the mirror copy, so no tier is left holding a stale value.
//!
//! # Strategies
//!
//! - [`TimeBasedStrategy`] - keys idle longer than a per-pattern threshold
//! - [`EventBasedStrategy`] - keys bound to a named event
//! - [`VersionBasedStrategy`] - keys whose persisted version marker is stale
//!
//! Additional strategies plug into [`InvalidationManager`] by name.

pub mod manager;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::MirrorInvalidator;
use crate::error::Result;
use crate::store::BackingStore;

pub use manager::{InvalidationManager, StrategyMetrics, PATTERN_STRATEGY};
pub use strategies::{
    version_marker_key, EventBasedStrategy, TimeBasedStrategy, VersionBasedStrategy,
};

/// Per-key facts a strategy decides on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMetadata {
    /// Time since last access, `None` if unknown
    pub idle_time: Option<Duration>,
    /// Persisted version marker, `None` if absent
    pub version_marker: Option<String>,
}

/// Pluggable invalidation strategy
#[async_trait]
pub trait InvalidationStrategy: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Decide whether `key` should be invalidated given its metadata
    fn should_invalidate(&self, key: &str, metadata: &KeyMetadata) -> bool;

    /// Invalidate the subset of `keys` this strategy selects.
    ///
    /// Returns the number of keys removed from the backing store.
    async fn invalidate(&self, keys: &[String]) -> Result<usize>;
}

/// Handles every strategy needs to clear both tiers
#[derive(Clone)]
pub struct StrategyContext {
    store: Arc<dyn BackingStore>,
    mirror: Arc<dyn MirrorInvalidator>,
}

impl StrategyContext {
    pub fn new(store: Arc<dyn BackingStore>, mirror: Arc<dyn MirrorInvalidator>) -> Self {
        Self { store, mirror }
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Delete `key` from the backing store, then from the mirror.
    ///
    /// The mirror copy is dropped even if the store delete fails.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let result = self.store.delete(key).await;
        self.mirror.invalidate_mirror(key);
        if let Err(e) = &result {
            warn!(key, error = %e, "Backing store delete failed");
        }
        result
    }
}

/// Invalidation request routed by [`InvalidationManager::dispatch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationRequest {
    /// Every key matching a glob
    Pattern { pattern: String },
    /// A key plus every key bound to an event
    Event { event: String, key: String },
    /// A key whose authoritative version changed
    Version { key: String, version: i64 },
    /// Keys older than `seconds` (argument validation only)
    MaxAge { seconds: i64 },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization() {
        let req: InvalidationRequest =
            serde_json::from_str(r#"{"type":"pattern","pattern":"session:*"}"#).unwrap();
        assert_eq!(
            req,
            InvalidationRequest::Pattern {
                pattern: "session:*".into()
            }
        );

        let req: InvalidationRequest =
            serde_yaml::from_str("type: version\nkey: model:x\nversion: 2\n").unwrap();
        assert_eq!(
            req,
            InvalidationRequest::Version {
                key: "model:x".into(),
                version: 2
            }
        );
    }
}
