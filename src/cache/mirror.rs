//! In-Process Mirror
//!
//! Process-local copy of recently read or written entries, consulted before
//! the backing store. Entries carry an absolute expiry and are dropped lazily
//! on the next lookup after they expire. The mirror is not persisted.
//!
//! # Design
//!
//! - One coarse `RwLock` around a `HashMap`, separate from the policy lock
//! - Byte-size and hit/miss accounting via atomics
//! - An invalidation generation, bumped by every `remove` under the write
//!   lock. Fills that raced with an invalidation are dropped by
//!   [`Mirror::insert_if_unchanged`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use super::data_type::DataType;

/// Mirror entry with absolute expiry
#[derive(Debug, Clone)]
pub struct MirrorEntry {
    /// Cached value
    pub value: Bytes,
    /// Category the value was written under (unknown after repopulation)
    pub data_type: Option<DataType>,
    /// Time the entry was written
    pub written_at: Instant,
    /// Absolute expiry
    pub expires_at: Instant,
}

impl MirrorEntry {
    /// Entry written now, `None` if `now + ttl` overflows the clock
    fn new(value: Bytes, data_type: Option<DataType>, ttl: Duration) -> Option<Self> {
        let now = Instant::now();
        Some(Self {
            value,
            data_type,
            written_at: now,
            expires_at: now.checked_add(ttl)?,
        })
    }

    /// Check if the entry has expired
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn size(&self, key: &str) -> u64 {
        (key.len() + self.value.len()) as u64
    }
}

/// Outcome of a mirror lookup
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorLookup {
    /// Live entry found
    Hit(Bytes),
    /// Entry was present but expired; it has been removed
    Expired,
    /// No entry
    Miss,
}

/// In-process mirror
#[derive(Debug, Default)]
pub struct Mirror {
    entries: RwLock<HashMap<String, MirrorEntry>>,
    size_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    generation: AtomicU64,
}

impl Mirror {
    /// Create an empty mirror
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key, dropping it if expired
    pub fn get(&self, key: &str) -> MirrorLookup {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return MirrorLookup::Hit(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return MirrorLookup::Miss;
                }
            }
        }

        // Expired: re-check under the write lock, a writer may have refreshed it
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                let size = entry.size(key);
                entries.remove(key);
                self.size_bytes.fetch_sub(size, Ordering::Relaxed);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                MirrorLookup::Expired
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                MirrorLookup::Hit(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                MirrorLookup::Miss
            }
        }
    }

    /// Current invalidation generation.
    ///
    /// Read it before fetching a value from the backing store and hand it to
    /// [`Mirror::insert_if_unchanged`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Insert or replace an entry expiring after `ttl`.
    ///
    /// Returns false when the expiry is not representable; nothing is stored.
    pub fn insert(&self, key: &str, value: Bytes, data_type: Option<DataType>, ttl: Duration) -> bool {
        let Some(entry) = MirrorEntry::new(value, data_type, ttl) else {
            return false;
        };
        let mut entries = self.entries.write();
        self.store_entry(&mut entries, key, entry);
        true
    }

    /// Insert only if no `remove` happened since `generation` was read.
    ///
    /// Returns whether the entry was stored.
    pub fn insert_if_unchanged(
        &self,
        key: &str,
        value: Bytes,
        data_type: Option<DataType>,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        let Some(entry) = MirrorEntry::new(value, data_type, ttl) else {
            return false;
        };
        let mut entries = self.entries.write();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.store_entry(&mut entries, key, entry);
        true
    }

    fn store_entry(&self, entries: &mut HashMap<String, MirrorEntry>, key: &str, entry: MirrorEntry) {
        let size = entry.size(key);
        if let Some(old) = entries.insert(key.to_string(), entry) {
            self.size_bytes.fetch_sub(old.size(key), Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Remove an entry, returning whether it was present.
    ///
    /// Bumps the invalidation generation whether or not the key was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        match entries.remove(key) {
            Some(old) => {
                self.size_bytes.fetch_sub(old.size(key), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Entry metadata without counting as a lookup
    pub fn peek(&self, key: &str) -> Option<MirrorEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut freed = 0u64;
        entries.retain(|key, entry| {
            if entry.is_expired(now) {
                freed += entry.size(key);
                false
            } else {
                true
            }
        });
        let removed = before - entries.len();
        self.size_bytes.fetch_sub(freed, Ordering::Relaxed);
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    /// Number of entries (including not-yet-purged expired ones)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the mirror is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Mirror statistics
    pub fn stats(&self) -> MirrorStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MirrorStats {
            entries: self.len(),
            size_bytes: self.size_bytes.load(Ordering::Relaxed),
            hits,
            misses,
            expired: self.expired.load(Ordering::Relaxed),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Mirror statistics
#[derive(Debug, Clone, Serialize)]
pub struct MirrorStats {
    /// Number of entries
    pub entries: usize,
    /// Approximate size in bytes (keys + values)
    pub size_bytes: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count (including expired lookups)
    pub misses: u64,
    /// Entries dropped because they expired
    pub expired: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get() {
        let mirror = Mirror::new();
        mirror.insert(
            "key",
            Bytes::from_static(b"value"),
            Some(DataType::Statistics),
            Duration::from_secs(60),
        );

        assert_eq!(mirror.get("key"), MirrorLookup::Hit(Bytes::from_static(b"value")));
        assert_eq!(mirror.get("other"), MirrorLookup::Miss);

        let stats = mirror.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 8);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_removed_on_lookup() {
        let mirror = Mirror::new();
        mirror.insert("key", Bytes::from_static(b"v"), None, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(mirror.get("key"), MirrorLookup::Expired);
        assert!(mirror.is_empty());
        assert_eq!(mirror.stats().size_bytes, 0);
        assert_eq!(mirror.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_replace_tracks_size() {
        let mirror = Mirror::new();
        mirror.insert("k", Bytes::from_static(b"short"), None, Duration::from_secs(60));
        mirror.insert("k", Bytes::from_static(b"much longer"), None, Duration::from_secs(60));

        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.stats().size_bytes, 12);
    }

    #[tokio::test]
    async fn test_remove() {
        let mirror = Mirror::new();
        mirror.insert("k", Bytes::from_static(b"v"), None, Duration::from_secs(60));

        assert!(mirror.remove("k"));
        assert!(!mirror.remove("k"));
        assert_eq!(mirror.get("k"), MirrorLookup::Miss);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_not_stored() {
        let mirror = Mirror::new();
        assert!(!mirror.insert("k", Bytes::from_static(b"v"), None, Duration::MAX));
        assert!(!mirror.insert(
            "k",
            Bytes::from_static(b"v"),
            None,
            Duration::from_secs(u64::MAX)
        ));
        assert!(mirror.is_empty());
        assert_eq!(mirror.stats().size_bytes, 0);
    }

    #[tokio::test]
    async fn test_insert_skipped_after_remove() {
        let mirror = Mirror::new();
        let generation = mirror.generation();

        // Invalidation of a key that was never mirrored still counts
        assert!(!mirror.remove("k"));
        assert!(!mirror.insert_if_unchanged(
            "k",
            Bytes::from_static(b"stale"),
            None,
            Duration::from_secs(60),
            generation
        ));
        assert_eq!(mirror.get("k"), MirrorLookup::Miss);

        let generation = mirror.generation();
        assert!(mirror.insert_if_unchanged(
            "k",
            Bytes::from_static(b"fresh"),
            None,
            Duration::from_secs(60),
            generation
        ));
        assert_eq!(mirror.get("k"), MirrorLookup::Hit(Bytes::from_static(b"fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let mirror = Mirror::new();
        mirror.insert("short", Bytes::from_static(b"v"), None, Duration::from_secs(1));
        mirror.insert("long", Bytes::from_static(b"v"), None, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(mirror.purge_expired(), 1);
        assert_eq!(mirror.len(), 1);
        assert!(mirror.peek("long").is_some());
    }
}
