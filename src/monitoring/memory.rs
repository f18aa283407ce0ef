//! Memory Monitor
//!
//! Classifies backing-store memory usage against the configured limit and
//! keeps the memory alerts in step with it: an alert is raised when a level
//! is entered and resolved once usage falls back below it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::alerts::{AlertManager, AlertType};
use crate::error::Result;
use crate::store::{BackingStore, StoreInfo};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Usage ratio entering the warning level
    pub warning_threshold: f64,
    /// Usage ratio entering the critical level
    pub critical_threshold: f64,
    /// Memory limit the ratios are computed against
    pub max_memory_mb: u64,
    /// Fragmentation ratio above which an alert is raised
    pub fragmentation_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.70,
            critical_threshold: 0.85,
            max_memory_mb: 512,
            fragmentation_threshold: 1.5,
        }
    }
}

/// Memory usage level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLevel::Normal => write!(f, "normal"),
            MemoryLevel::Warning => write!(f, "warning"),
            MemoryLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Point-in-time memory reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub used_bytes: u64,
    pub used_mb: f64,
    pub max_mb: u64,
    /// `used / max`, 0 when no limit is configured
    pub usage_ratio: f64,
    /// Highest `used_bytes` observed so far
    pub peak_bytes: u64,
    pub fragmentation_ratio: f64,
    pub level: MemoryLevel,
}

impl Default for MemoryStats {
    fn default() -> Self {
        Self {
            used_bytes: 0,
            used_mb: 0.0,
            max_mb: 0,
            usage_ratio: 0.0,
            peak_bytes: 0,
            fragmentation_ratio: 1.0,
            level: MemoryLevel::Normal,
        }
    }
}

/// Memory monitor
pub struct MemoryMonitor {
    config: MemoryConfig,
    alerts: Arc<AlertManager>,
    peak_bytes: AtomicU64,
    last: RwLock<Option<MemoryStats>>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryConfig, alerts: Arc<AlertManager>) -> Self {
        Self {
            config,
            alerts,
            peak_bytes: AtomicU64::new(0),
            last: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Fetch telemetry from the store and evaluate it
    pub async fn check(&self, store: &dyn BackingStore) -> Result<MemoryStats> {
        let info = store.info().await?;
        Ok(self.evaluate(&info))
    }

    /// Classify a telemetry reading and raise or resolve memory alerts
    pub fn evaluate(&self, info: &StoreInfo) -> MemoryStats {
        let used_bytes = info.used_memory;
        let previous_peak = self.peak_bytes.fetch_max(used_bytes, Ordering::Relaxed);
        let peak_bytes = previous_peak.max(used_bytes);

        let max_bytes = self.config.max_memory_mb as f64 * BYTES_PER_MB;
        let usage_ratio = if max_bytes > 0.0 {
            used_bytes as f64 / max_bytes
        } else {
            0.0
        };

        let level = if usage_ratio >= self.config.critical_threshold {
            MemoryLevel::Critical
        } else if usage_ratio >= self.config.warning_threshold {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        };

        let stats = MemoryStats {
            used_bytes,
            used_mb: used_bytes as f64 / BYTES_PER_MB,
            max_mb: self.config.max_memory_mb,
            usage_ratio,
            peak_bytes,
            fragmentation_ratio: info.fragmentation_ratio,
            level,
        };

        self.update_alerts(&stats);
        debug!(
            used_mb = stats.used_mb,
            usage_ratio = stats.usage_ratio,
            level = %stats.level,
            "Memory evaluated"
        );
        *self.last.write() = Some(stats.clone());
        stats
    }

    /// Most recent reading
    pub fn last(&self) -> Option<MemoryStats> {
        self.last.read().clone()
    }

    fn update_alerts(&self, stats: &MemoryStats) {
        let percent = stats.usage_ratio * 100.0;

        if stats.level >= MemoryLevel::Warning {
            self.alerts.raise_once(
                AlertType::HighMemoryUsage,
                format!(
                    "Memory usage at {:.1}% ({:.1}MB of {}MB)",
                    percent, stats.used_mb, stats.max_mb
                ),
            );
        } else {
            self.alerts.resolve(AlertType::HighMemoryUsage);
        }

        if stats.level == MemoryLevel::Critical {
            if self
                .alerts
                .raise_once(
                    AlertType::CriticalMemoryUsage,
                    format!(
                        "Memory usage critical at {:.1}% ({:.1}MB of {}MB)",
                        percent, stats.used_mb, stats.max_mb
                    ),
                )
                .is_some()
            {
                warn!(usage_ratio = stats.usage_ratio, "Memory usage entered critical level");
            }
        } else {
            self.alerts.resolve(AlertType::CriticalMemoryUsage);
        }

        if stats.fragmentation_ratio > self.config.fragmentation_threshold {
            self.alerts.raise_once(
                AlertType::MemoryFragmentation,
                format!(
                    "Memory fragmentation ratio {:.2} exceeds {:.2}",
                    stats.fragmentation_ratio, self.config.fragmentation_threshold
                ),
            );
        } else {
            self.alerts.resolve(AlertType::MemoryFragmentation);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
