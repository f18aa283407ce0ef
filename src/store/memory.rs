//! In-Memory Backing Store
//!
//! DashMap-backed store with Redis-like semantics: lazy expiry on access,
//! idle-time tracking and keyspace hit/miss counters. Time comes from the
//! tokio clock, so tests can pause and advance it deterministically.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::pattern::glob_match;
use super::{BackingStore, KeyTtl, StoreInfo};
use crate::error::{Error, Result};

/// Stored value with expiry and access tracking
#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Option<Instant>,
    last_access: Instant,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// In-memory backing store
pub struct InMemoryBackingStore {
    /// Storage - sharded for concurrency
    storage: DashMap<String, StoredValue>,
    /// Simulated memory limit in bytes (0 = unlimited)
    max_memory: u64,
    /// When false every command fails with a connectivity error
    available: AtomicBool,
    /// Commands on keys (or scan patterns) with this prefix fail
    failing_prefix: RwLock<Option<String>>,
    // Statistics
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    commands: AtomicU64,
}

impl Default for InMemoryBackingStore {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            max_memory: 0,
            available: AtomicBool::new(true),
            failing_prefix: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            commands: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackingStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store reporting a memory limit (for pressure telemetry)
    pub fn with_max_memory(max_memory: u64) -> Self {
        Self {
            max_memory,
            ..Self::default()
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail commands touching keys that start with `prefix` (`None` heals).
    ///
    /// Scans fail when their pattern starts with the prefix. Other keys keep
    /// working, which simulates a partial outage.
    pub fn set_failing_prefix(&self, prefix: Option<&str>) {
        *self.failing_prefix.write() = prefix.map(str::to_string);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.storage.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Check if the store holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn command(&self) -> Result<()> {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connectivity("in-memory store marked unavailable".to_string()))
        }
    }

    /// `command` plus the prefix check for `key`
    fn key_command(&self, key: &str) -> Result<()> {
        self.command()?;
        match self.failing_prefix.read().as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(Error::Backend(format!(
                "injected failure for keys under {}",
                prefix
            ))),
            _ => Ok(()),
        }
    }

    /// Remove the key if it has expired; returns true when it was removed
    fn purge_if_expired(&self, key: &str, now: Instant) -> bool {
        let removed = self
            .storage
            .remove_if(key, |_, value| value.is_expired(now))
            .is_some();
        if removed {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    fn used_memory(&self) -> u64 {
        self.storage
            .iter()
            .map(|e| (e.key().len() + e.value().data.len()) as u64)
            .sum()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.key_command(key)?;
        let now = Instant::now();
        self.purge_if_expired(key, now);

        match self.storage.get_mut(key) {
            Some(mut value) => {
                value.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value.data.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, KeyTtl)>> {
        self.key_command(key)?;
        let now = Instant::now();
        self.purge_if_expired(key, now);

        match self.storage.get_mut(key) {
            Some(mut value) => {
                value.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                let ttl = match value.expires_at {
                    Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
                    None => KeyTtl::Persistent,
                };
                Ok(Some((value.data.clone(), ttl)))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.key_command(key)?;
        if ttl.is_zero() {
            return Err(Error::invalid_argument("expiry must be positive"));
        }
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        self.storage.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: Some(expires_at),
                last_access: now,
            },
        );
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.key_command(key)?;
        let now = Instant::now();
        self.storage.insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at: None,
                last_access: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.key_command(key)?;
        let now = Instant::now();
        if self.purge_if_expired(key, now) {
            return Ok(false);
        }
        Ok(self.storage.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.key_command(key)?;
        if ttl.is_zero() {
            return Err(Error::invalid_argument("expiry must be positive"));
        }
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        self.purge_if_expired(key, now);
        match self.storage.get_mut(key) {
            Some(mut value) => {
                value.expires_at = Some(expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.key_command(key)?;
        let now = Instant::now();
        self.purge_if_expired(key, now);
        Ok(match self.storage.get(key) {
            Some(value) => match value.expires_at {
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
                None => KeyTtl::Persistent,
            },
            None => KeyTtl::Missing,
        })
    }

    async fn idle_time(&self, key: &str) -> Result<Option<Duration>> {
        self.key_command(key)?;
        let now = Instant::now();
        self.purge_if_expired(key, now);
        Ok(self
            .storage
            .get(key)
            .map(|value| now.saturating_duration_since(value.last_access)))
    }

    async fn scan(&self, pattern: &str, limit: Option<usize>) -> Result<Vec<String>> {
        self.key_command(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .storage
            .iter()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        self.command()?;
        Ok(start.elapsed())
    }

    async fn info(&self) -> Result<StoreInfo> {
        self.command()?;
        Ok(StoreInfo {
            keyspace_hits: self.hits.load(Ordering::Relaxed),
            keyspace_misses: self.misses.load(Ordering::Relaxed),
            evicted_keys: 0,
            expired_keys: self.expired.load(Ordering::Relaxed),
            used_memory: self.used_memory(),
            max_memory: self.max_memory,
            fragmentation_ratio: 1.0,
            total_commands: self.commands.load(Ordering::Relaxed),
            key_count: self.len() as u64,
        })
    }
}

fn expiry(now: Instant, ttl: Duration) -> Result<Instant> {
    now.checked_add(ttl).ok_or_else(|| {
        Error::invalid_argument(format!("expiry of {}s is out of range", ttl.as_secs()))
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get() {
        let store = InMemoryBackingStore::new();
        store
            .set_ex("key", Bytes::from_static(b"data"), Duration::from_secs(60))
            .await
            .unwrap();

        let value = store.get("key").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"data")));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let info = store.info().await.unwrap();
        assert_eq!(info.keyspace_hits, 1);
        assert_eq!(info.keyspace_misses, 1);
        assert_eq!(info.key_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry() {
        let store = InMemoryBackingStore::new();
        store
            .set_ex("key", Bytes::from_static(b"data"), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("key").await.unwrap(), None);
        assert_eq!(store.ttl("key").await.unwrap(), KeyTtl::Missing);
        assert_eq!(store.info().await.unwrap().expired_keys, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_and_idle_time() {
        let store = InMemoryBackingStore::new();
        store
            .set_ex("key", Bytes::from_static(b"data"), Duration::from_secs(100))
            .await
            .unwrap();
        store.set("marker", Bytes::from_static(b"v1")).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(
            store.ttl("key").await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(70))
        );
        assert_eq!(store.ttl("marker").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(
            store.idle_time("key").await.unwrap(),
            Some(Duration::from_secs(30))
        );

        // Reads reset idle time, TTL probes do not
        store.get("key").await.unwrap();
        assert_eq!(store.idle_time("key").await.unwrap(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_delete_and_expire() {
        let store = InMemoryBackingStore::new();
        store.set("key", Bytes::from_static(b"data")).await.unwrap();

        assert!(store.expire("key", Duration::from_secs(5)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());

        assert!(store.delete("key").await.unwrap());
        assert!(!store.delete("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_with_limit() {
        let store = InMemoryBackingStore::new();
        for i in 0..10 {
            store
                .set(&format!("session:{}", i), Bytes::from_static(b"s"))
                .await
                .unwrap();
        }
        store.set("stats:1", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(store.scan("session:*", None).await.unwrap().len(), 10);
        assert_eq!(store.scan("session:*", Some(3)).await.unwrap().len(), 3);
        assert_eq!(store.scan("stats:*", None).await.unwrap(), vec!["stats:1"]);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryBackingStore::new();
        store.set_available(false);

        let err = store.get("key").await.unwrap_err();
        assert!(err.is_connectivity());

        store.set_available(true);
        assert!(store.get("key").await.is_ok());
    }

    #[tokio::test]
    async fn test_unrepresentable_expiry_rejected() {
        let store = InMemoryBackingStore::new();
        let err = store
            .set_ex("key", Bytes::from_static(b"data"), Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(store.get("key").await.unwrap(), None);

        store.set("key", Bytes::from_static(b"data")).await.unwrap();
        assert!(store.expire("key", Duration::MAX).await.is_err());
        assert_eq!(store.ttl("key").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_failing_prefix_is_scoped() {
        let store = InMemoryBackingStore::new();
        store.set("model:1", Bytes::from_static(b"w")).await.unwrap();
        store.set("stats:1", Bytes::from_static(b"x")).await.unwrap();
        store.set_failing_prefix(Some("model:"));

        assert!(store.get("model:1").await.is_err());
        assert!(store.scan("model:*", None).await.is_err());
        assert!(!store.get("model:1").await.unwrap_err().is_connectivity());
        assert!(store.get("stats:1").await.unwrap().is_some());
        assert_eq!(store.scan("stats:*", None).await.unwrap().len(), 1);
        assert!(store.info().await.is_ok());

        store.set_failing_prefix(None);
        assert!(store.get("model:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_pressure() {
        let store = InMemoryBackingStore::with_max_memory(100);
        store.set("k", Bytes::from(vec![0u8; 49])).await.unwrap();

        let info = store.info().await.unwrap();
        assert_eq!(info.used_memory, 50);
        assert_eq!(info.memory_pressure(), Some(0.5));
    }
}
