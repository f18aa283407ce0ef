//! Granted TTLs
//!
//! Remembers the TTL each key was last written or re-expired with, so TTL
//! utilization is measured against what the key was actually given rather
//! than the policy in force now. Entries lapse with the key they describe.
//!
//! Only writes made through this process are known. Keys written elsewhere
//! have no grant and callers fall back to the current policy.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Grant {
    ttl: Duration,
    expires_at: Instant,
}

/// Per-key record of granted TTLs
#[derive(Debug, Default)]
pub struct GrantLog {
    grants: DashMap<String, Grant>,
}

impl GrantLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` was just given `ttl`
    pub fn record(&self, key: &str, ttl: Duration) {
        match Instant::now().checked_add(ttl) {
            Some(expires_at) => {
                self.grants.insert(key.to_string(), Grant { ttl, expires_at });
            }
            None => {
                self.grants.remove(key);
            }
        }
    }

    /// TTL granted to `key`, `None` if unknown or lapsed
    pub fn granted(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.grants
            .get(key)
            .filter(|grant| now < grant.expires_at)
            .map(|grant| grant.ttl)
    }

    pub fn forget(&self, key: &str) {
        self.grants.remove(key);
    }

    /// Drop lapsed grants, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.grants.len();
        self.grants.retain(|_, grant| now < grant.expires_at);
        before.saturating_sub(self.grants.len())
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_grant_lapses_with_key() {
        let log = GrantLog::new();
        log.record("stats:1", Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(log.granted("stats:1"), Some(Duration::from_secs(100)));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(log.granted("stats:1"), None);
        assert_eq!(log.purge_expired(), 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_replaces_grant() {
        let log = GrantLog::new();
        log.record("k", Duration::from_secs(100));
        log.record("k", Duration::from_secs(30));
        assert_eq!(log.granted("k"), Some(Duration::from_secs(30)));

        log.record("k", Duration::MAX);
        assert_eq!(log.granted("k"), None);

        log.record("k", Duration::from_secs(30));
        log.forget("k");
        assert_eq!(log.granted("k"), None);
        assert_eq!(log.len(), 0);
    }
}
