//! Usage statistics and TTL recommendations
//!
//! Types produced by an analysis cycle plus the rule table that turns
//! [`UsageStats`] into at most one [`TtlOptimization`] per data type.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::DataType;

/// Thresholds the recommendation rules are evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerThresholds {
    /// Hit rate below which TTLs are lengthened
    pub min_hit_rate: f64,
    /// Eviction rate above which TTLs are shortened
    pub max_eviction_rate: f64,
    /// Utilization below which TTLs are shortened
    pub min_ttl_utilization: f64,
    /// Utilization above which TTLs are lengthened
    pub max_ttl_utilization: f64,
}

impl Default for AnalyzerThresholds {
    fn default() -> Self {
        Self {
            min_hit_rate: 0.8,
            max_eviction_rate: 0.1,
            min_ttl_utilization: 0.5,
            max_ttl_utilization: 0.9,
        }
    }
}

/// Coarse access-frequency label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    /// Touched within roughly the last minute
    Frequent,
    /// Touched within roughly the last ten minutes
    Moderate,
    /// Idle for longer
    Rare,
}

impl AccessPattern {
    /// Label an access-frequency proxy in `[0, 1]`
    pub fn from_frequency(frequency: f64) -> Self {
        if frequency >= 0.5 {
            AccessPattern::Frequent
        } else if frequency >= 0.1 {
            AccessPattern::Moderate
        } else {
            AccessPattern::Rare
        }
    }

    /// TTL recommended for keys with this pattern
    pub fn recommended_ttl(&self) -> Duration {
        match self {
            AccessPattern::Frequent => Duration::from_secs(2 * 60 * 60),
            AccessPattern::Moderate => Duration::from_secs(60 * 60),
            AccessPattern::Rare => Duration::from_secs(10 * 60),
        }
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPattern::Frequent => write!(f, "frequent"),
            AccessPattern::Moderate => write!(f, "moderate"),
            AccessPattern::Rare => write!(f, "rare"),
        }
    }
}

/// Access-frequency proxy derived from idle time.
///
/// `1 / (1 + idle_minutes)`: 1.0 for a key touched just now, 0.5 after one
/// idle minute. This is a heuristic, not a per-key access counter.
pub fn access_frequency(idle: Duration) -> f64 {
    1.0 / (1.0 + idle.as_secs_f64() / 60.0)
}

/// Fraction of the granted TTL already consumed, clamped to `[0, 1]`
pub fn ttl_utilization(granted_ttl: Duration, remaining: Duration) -> f64 {
    if granted_ttl.is_zero() {
        return 0.0;
    }
    let consumed = granted_ttl.as_secs_f64() - remaining.as_secs_f64();
    (consumed / granted_ttl.as_secs_f64()).clamp(0.0, 1.0)
}

/// Usage statistics for one data type, recomputed every cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub data_type: DataType,
    /// Keys sampled this cycle
    pub sampled_keys: usize,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_rate: f64,
    /// Mean idle time of sampled keys (seconds)
    pub average_access_time: f64,
    /// Mean access-frequency proxy of sampled keys
    pub access_frequency: f64,
    /// Mean fraction of granted TTL consumed
    pub ttl_utilization: f64,
}

impl UsageStats {
    /// Stats for a data type with no sampled keys
    pub fn empty(data_type: DataType) -> Self {
        Self {
            data_type,
            sampled_keys: 0,
            hit_rate: 0.0,
            miss_rate: 0.0,
            eviction_rate: 0.0,
            average_access_time: 0.0,
            access_frequency: 0.0,
            ttl_utilization: 0.0,
        }
    }

    /// True when nothing was sampled
    pub fn is_empty(&self) -> bool {
        self.sampled_keys == 0
    }
}

/// Suggested TTL change for one data type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtlOptimization {
    pub data_type: DataType,
    pub current_ttl_secs: u64,
    pub suggested_ttl_secs: u64,
    pub reason: String,
    pub confidence: f64,
    /// Whether the suggestion was applied to the policy store
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

impl TtlOptimization {
    pub fn current_ttl(&self) -> Duration {
        Duration::from_secs(self.current_ttl_secs)
    }

    pub fn suggested_ttl(&self) -> Duration {
        Duration::from_secs(self.suggested_ttl_secs)
    }
}

/// Outcome of the rule table before it is stamped and applied
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub suggested_ttl: Duration,
    pub reason: &'static str,
    pub confidence: f64,
}

/// Evaluate the rule table; the first matching rule wins.
///
/// Returns `None` for empty stats or when no rule fires. The suggested TTL is
/// rounded to whole seconds and kept within `[1s, max_ttl]`.
pub fn evaluate_rules(
    stats: &UsageStats,
    current_ttl: Duration,
    thresholds: &AnalyzerThresholds,
    max_ttl: Duration,
) -> Option<RuleOutcome> {
    if stats.is_empty() {
        return None;
    }

    let (factor, reason, confidence) = if stats.hit_rate < thresholds.min_hit_rate {
        (1.5, "low hit rate", 0.8)
    } else if stats.eviction_rate > thresholds.max_eviction_rate {
        (0.8, "high eviction rate", 0.7)
    } else if stats.ttl_utilization < thresholds.min_ttl_utilization {
        (0.7, "low utilization", 0.6)
    } else if stats.ttl_utilization > thresholds.max_ttl_utilization {
        (1.2, "high utilization", 0.6)
    } else {
        return None;
    };

    let ceiling = max_ttl.as_secs().max(1) as f64;
    let secs = (current_ttl.as_secs_f64() * factor).round().clamp(1.0, ceiling) as u64;
    Some(RuleOutcome {
        suggested_ttl: Duration::from_secs(secs),
        reason,
        confidence,
    })
}

/// Result of sampling a key pattern
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternAnalysis {
    pub pattern: String,
    /// Keys matching the pattern
    pub key_count: usize,
    /// Keys actually inspected
    pub sampled_keys: usize,
    /// Mean remaining TTL of sampled keys with an expiry (seconds)
    pub average_ttl_secs: f64,
    /// Mean idle time of sampled keys (seconds)
    pub average_idle_secs: f64,
    /// `None` when no key matched
    pub access_pattern: Option<AccessPattern>,
    /// `None` when no key matched
    pub recommended_ttl_secs: Option<u64>,
}

/// Analyzer counters and the last cycle's state
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerMetrics {
    pub total_analyses: u64,
    pub optimizations_suggested: u64,
    pub optimizations_applied: u64,
    pub partial_failures: u64,
    pub last_analysis: Option<DateTime<Utc>>,
    pub usage_stats: BTreeMap<DataType, UsageStats>,
    /// Current policies (seconds)
    pub current_policies: BTreeMap<DataType, u64>,
}

// =============================================================================
// Tests
// =============================================================================
