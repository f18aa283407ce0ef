//! Redis Backing Store
//!
//! Redis adapter over a multiplexed `ConnectionManager`, which reconnects
//! transparently after connection loss. Connection-level failures map to
//! `Error::Connectivity`, everything else to `Error::Backend`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use tracing::{debug, info, instrument};

use super::{BackingStore, KeyTtl, StoreInfo};
use crate::error::{Error, Result};

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 500;

/// Redis-backed store
#[derive(Clone)]
pub struct RedisBackingStore {
    conn: ConnectionManager,
    url: String,
}

impl RedisBackingStore {
    /// Connect to the Redis server at `url`
    #[instrument(skip(url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Config(format!("invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis backing store");
        Ok(Self {
            conn,
            url: url.to_string(),
        })
    }

    /// Server URL this store was opened with
    pub fn url(&self) -> &str {
        &self.url
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn millis(d: Duration) -> u64 {
    // Redis rejects a zero expiry; round sub-millisecond TTLs up
    (d.as_millis() as u64).max(1)
}

fn ttl_from_pttl(pttl: i64) -> KeyTtl {
    match pttl {
        -2 => KeyTtl::Missing,
        -1 => KeyTtl::Persistent,
        ms if ms >= 0 => KeyTtl::Expires(Duration::from_millis(ms as u64)),
        _ => KeyTtl::Missing,
    }
}

#[async_trait]
impl BackingStore for RedisBackingStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, KeyTtl)>> {
        let mut conn = self.conn();
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|v| (Bytes::from(v), ttl_from_pttl(pttl))))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::invalid_argument("expiry must be positive"));
        }
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(&value[..])
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(&value[..])
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return Err(Error::invalid_argument("expiry must be positive"));
        }
        let mut conn = self.conn();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl_from_pttl(pttl))
    }

    async fn idle_time(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn();
        let idle: Option<u64> = redis::cmd("OBJECT")
            .arg("IDLETIME")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(idle.map(Duration::from_secs))
    }

    #[instrument(skip(self))]
    async fn scan(&self, pattern: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);

            if let Some(limit) = limit {
                if keys.len() >= limit {
                    keys.truncate(limit);
                    break;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations
        keys.sort();
        keys.dedup();
        debug!(pattern, found = keys.len(), "Scanned keys");
        Ok(keys)
    }

    async fn ping(&self) -> Result<Duration> {
        let mut conn = self.conn();
        let start = Instant::now();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(start.elapsed())
    }

    async fn info(&self) -> Result<StoreInfo> {
        let mut conn = self.conn();
        let raw: String = redis::cmd("INFO").query_async(&mut conn).await?;
        let mut info = parse_info(&raw);
        let db_size: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        info.key_count = db_size;
        Ok(info)
    }
}

/// Parse the text returned by Redis `INFO` into [`StoreInfo`].
///
/// Unknown fields are ignored; missing fields stay at their defaults.
pub fn parse_info(raw: &str) -> StoreInfo {
    let mut info = StoreInfo {
        fragmentation_ratio: 1.0,
        ..Default::default()
    };

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let as_u64 = || value.trim().parse::<u64>().unwrap_or(0);
        match field {
            "keyspace_hits" => info.keyspace_hits = as_u64(),
            "keyspace_misses" => info.keyspace_misses = as_u64(),
            "evicted_keys" => info.evicted_keys = as_u64(),
            "expired_keys" => info.expired_keys = as_u64(),
            "used_memory" => info.used_memory = as_u64(),
            "maxmemory" => info.max_memory = as_u64(),
            "total_commands_processed" => info.total_commands = as_u64(),
            "mem_fragmentation_ratio" => {
                info.fragmentation_ratio = value.trim().parse::<f64>().unwrap_or(1.0)
            }
            _ => {}
        }
    }
    info
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INFO: &str = "# Stats\r\n\
        total_commands_processed:1200\r\n\
        keyspace_hits:900\r\n\
        keyspace_misses:100\r\n\
        evicted_keys:7\r\n\
        expired_keys:42\r\n\
        \r\n\
        # Memory\r\n\
        used_memory:1048576\r\n\
        maxmemory:536870912\r\n\
        mem_fragmentation_ratio:1.35\r\n";

    #[test]
    fn test_parse_info() {
        let info = parse_info(SAMPLE_INFO);
        assert_eq!(info.total_commands, 1200);
        assert_eq!(info.keyspace_hits, 900);
        assert_eq!(info.keyspace_misses, 100);
        assert_eq!(info.evicted_keys, 7);
        assert_eq!(info.expired_keys, 42);
        assert_eq!(info.used_memory, 1_048_576);
        assert_eq!(info.max_memory, 536_870_912);
        assert!((info.fragmentation_ratio - 1.35).abs() < f64::EPSILON);
        assert_eq!(info.hit_rate(), Some(0.9));
    }

    #[test]
    fn test_parse_info_tolerates_garbage() {
        let info = parse_info("nonsense\r\nkeyspace_hits:abc\r\n");
        assert_eq!(info.keyspace_hits, 0);
        assert_eq!(info.fragmentation_ratio, 1.0);
    }

    #[test]
    fn test_ttl_from_pttl() {
        assert_eq!(ttl_from_pttl(-2), KeyTtl::Missing);
        assert_eq!(ttl_from_pttl(-1), KeyTtl::Persistent);
        assert_eq!(
            ttl_from_pttl(1500),
            KeyTtl::Expires(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_millis_rounds_up() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
