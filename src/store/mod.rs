//! Backing Store Port
//!
//! The authoritative, shared key-value store every cache instance relies on.
//! The engine talks to it exclusively through [`BackingStore`], so the Redis
//! adapter and the in-memory adapter used by tests are interchangeable.
//!
//! # Adapters
//!
//! - [`InMemoryBackingStore`] - DashMap-backed, driven by the tokio clock
//! - `RedisBackingStore` - Redis over a multiplexed connection manager
//!   (feature `redis`)

mod memory;
pub mod pattern;
#[cfg(feature = "redis")]
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

pub use memory::InMemoryBackingStore;
pub use pattern::glob_match;
#[cfg(feature = "redis")]
pub use redis_store::{parse_info, RedisBackingStore};

/// Expiry state of a key in the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiry
    Persistent,
    /// Key expires after the remaining duration
    Expires(Duration),
}

impl KeyTtl {
    /// Remaining duration, if the key has an expiry
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }

    /// True unless the key is missing
    pub fn exists(&self) -> bool {
        !matches!(self, KeyTtl::Missing)
    }
}

/// Telemetry exposed by the backing store (Redis `INFO` equivalents)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreInfo {
    /// Successful key lookups
    pub keyspace_hits: u64,
    /// Failed key lookups
    pub keyspace_misses: u64,
    /// Keys evicted due to memory pressure
    pub evicted_keys: u64,
    /// Keys removed by expiry
    pub expired_keys: u64,
    /// Memory in use (bytes)
    pub used_memory: u64,
    /// Configured memory limit (bytes, 0 = unlimited/unknown)
    pub max_memory: u64,
    /// Allocator fragmentation ratio (rss / used)
    pub fragmentation_ratio: f64,
    /// Total commands processed since start
    pub total_commands: u64,
    /// Number of keys currently stored
    pub key_count: u64,
}

impl StoreInfo {
    /// Hit rate over all lookups, `None` when no lookups were recorded
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.keyspace_hits + self.keyspace_misses;
        if total == 0 {
            None
        } else {
            Some(self.keyspace_hits as f64 / total as f64)
        }
    }

    /// Memory usage relative to the limit, `None` when no limit is known
    pub fn memory_pressure(&self) -> Option<f64> {
        if self.max_memory == 0 {
            None
        } else {
            Some(self.used_memory as f64 / self.max_memory as f64)
        }
    }
}

/// Backing store port
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Read a value together with its expiry state
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, KeyTtl)>> {
        match self.get(key).await? {
            Some(value) => {
                let ttl = self.ttl(key).await?;
                Ok(Some((value, ttl)))
            }
            None => Ok(None),
        }
    }

    /// Write a value that expires after `ttl`
    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Write a value without expiry
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Reset the expiry of an existing key, returning whether it existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Expiry state of a key (does not count as an access)
    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Time since the key was last read or written, `None` if missing
    async fn idle_time(&self, key: &str) -> Result<Option<Duration>>;

    /// Keys matching a glob, stopping after `limit` keys when given
    async fn scan(&self, pattern: &str, limit: Option<usize>) -> Result<Vec<String>>;

    /// Round-trip latency check
    async fn ping(&self) -> Result<Duration>;

    /// Store-wide telemetry
    async fn info(&self) -> Result<StoreInfo>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ttl_helpers() {
        assert_eq!(
            KeyTtl::Expires(Duration::from_secs(5)).remaining(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(KeyTtl::Persistent.remaining(), None);
        assert!(KeyTtl::Persistent.exists());
        assert!(!KeyTtl::Missing.exists());
    }

    #[test]
    fn test_store_info_rates() {
        let info = StoreInfo {
            keyspace_hits: 3,
            keyspace_misses: 1,
            used_memory: 256,
            max_memory: 1024,
            ..Default::default()
        };
        assert_eq!(info.hit_rate(), Some(0.75));
        assert_eq!(info.memory_pressure(), Some(0.25));

        let idle = StoreInfo::default();
        assert_eq!(idle.hit_rate(), None);
        assert_eq!(idle.memory_pressure(), None);
    }
}
