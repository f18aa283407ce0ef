//! TTL Policy Store
//!
//! Process-wide mapping from [`DataType`] to TTL, guarded by a single
//! reader/writer lock. A completed `set` is visible to every later `get`.
//! Every stored TTL lies in `(0, max_ttl]`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::RwLock;

use super::data_type::DataType;
use crate::error::{Error, Result};

/// Upper bound on any policy TTL unless configured otherwise (30 days)
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// TTL policy store
#[derive(Debug)]
pub struct PolicyStore {
    policies: RwLock<HashMap<DataType, Duration>>,
    max_ttl: Duration,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// Create a store seeded with the built-in policies
    pub fn new() -> Self {
        let policies = DataType::ALL
            .iter()
            .map(|dt| (*dt, dt.default_ttl()))
            .collect();
        Self {
            policies: RwLock::new(policies),
            max_ttl: DEFAULT_MAX_TTL,
        }
    }

    /// Create a store from explicit policies bounded by `max_ttl`.
    ///
    /// Types without an entry fall back to the `DefaultValues` policy at
    /// lookup time.
    pub fn with_policies(policies: HashMap<DataType, Duration>, max_ttl: Duration) -> Result<Self> {
        if max_ttl.is_zero() {
            return Err(Error::invalid_argument("max TTL must be positive"));
        }
        for (dt, ttl) in &policies {
            check_ttl(*dt, *ttl, max_ttl)?;
        }
        Ok(Self {
            policies: RwLock::new(policies),
            max_ttl,
        })
    }

    /// Largest TTL the store accepts
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// TTL for a data type, falling back to the default policy
    pub fn get(&self, data_type: DataType) -> Duration {
        let policies = self.policies.read();
        policies
            .get(&data_type)
            .or_else(|| policies.get(&DataType::DefaultValues))
            .copied()
            .unwrap_or_else(|| DataType::DefaultValues.default_ttl())
    }

    /// Replace the TTL for a data type, returning the previous value.
    ///
    /// A zero TTL or one above `max_ttl` is rejected and the stored value is
    /// left untouched.
    pub fn set(&self, data_type: DataType, ttl: Duration) -> Result<Option<Duration>> {
        check_ttl(data_type, ttl, self.max_ttl)?;
        Ok(self.policies.write().insert(data_type, ttl))
    }

    /// Ordered copy of every configured policy
    pub fn snapshot(&self) -> BTreeMap<DataType, Duration> {
        self.policies
            .read()
            .iter()
            .map(|(dt, ttl)| (*dt, *ttl))
            .collect()
    }
}

fn check_ttl(data_type: DataType, ttl: Duration, max_ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(Error::invalid_argument(format!(
            "TTL for {} must be positive",
            data_type
        )));
    }
    if ttl > max_ttl {
        return Err(Error::invalid_argument(format!(
            "TTL for {} ({}s) exceeds the maximum of {}s",
            data_type,
            ttl.as_secs(),
            max_ttl.as_secs()
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
