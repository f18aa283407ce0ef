//! Alert Manager
//!
//! Bounded FIFO log of alerts plus a handler registry keyed by
//! [`AlertType`]. Handlers run on the tokio runtime, detached from the
//! caller, so a slow handler never delays `trigger_alert`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default capacity of the alert log
pub const DEFAULT_ALERT_CAPACITY: usize = 1000;

/// Alert categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighMemoryUsage,
    CriticalMemoryUsage,
    LowHitRate,
    HighLatency,
    HighEvictionRate,
    MemoryFragmentation,
    BackendUnavailable,
}

impl AlertType {
    /// Severity is fixed per type
    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::CriticalMemoryUsage | AlertType::BackendUnavailable => {
                AlertSeverity::Critical
            }
            AlertType::HighMemoryUsage
            | AlertType::LowHitRate
            | AlertType::HighLatency
            | AlertType::HighEvictionRate
            | AlertType::MemoryFragmentation => AlertSeverity::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighMemoryUsage => "high_memory_usage",
            AlertType::CriticalMemoryUsage => "critical_memory_usage",
            AlertType::LowHitRate => "low_hit_rate",
            AlertType::HighLatency => "high_latency",
            AlertType::HighEvictionRate => "high_eviction_rate",
            AlertType::MemoryFragmentation => "memory_fragmentation",
            AlertType::BackendUnavailable => "backend_unavailable",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "INFO"),
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Create an unresolved alert with severity derived from its type
    pub fn new(alert_type: AlertType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            message: message.into(),
            timestamp: Utc::now(),
            severity: alert_type.severity(),
            resolved: false,
            resolved_at: None,
        }
    }
}

/// Receives alerts of the types it is registered for
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, alert: Alert);
}

/// Adapts a closure into an [`AlertHandler`]
pub struct FnAlertHandler<F>(pub F);

#[async_trait]
impl<F> AlertHandler for FnAlertHandler<F>
where
    F: Fn(Alert) + Send + Sync,
{
    async fn handle(&self, alert: Alert) {
        (self.0)(alert)
    }
}

/// Writes alerts to the log at a level matching their severity
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAlertHandler;

#[async_trait]
impl AlertHandler for LoggingAlertHandler {
    async fn handle(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{}",
                alert.message
            ),
            AlertSeverity::Info => info!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{}",
                alert.message
            ),
        }
    }
}

/// Alert statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct AlertStats {
    /// Alerts triggered since start (including ones evicted from the log)
    pub total_alerts: u64,
    pub alerts_by_type: BTreeMap<AlertType, u64>,
    pub alerts_by_severity: BTreeMap<AlertSeverity, u64>,
    /// Alerts marked resolved
    pub resolved_alerts: u64,
    /// Handler invocations spawned
    pub dispatched: u64,
    pub last_alert: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct AlertStorage {
    history: VecDeque<Alert>,
    stats: AlertStats,
}

/// Alert manager
pub struct AlertManager {
    capacity: usize,
    storage: RwLock<AlertStorage>,
    handlers: RwLock<HashMap<AlertType, Vec<Arc<dyn AlertHandler>>>>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertManager {
    /// Create a manager holding up to [`DEFAULT_ALERT_CAPACITY`] alerts
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ALERT_CAPACITY)
    }

    /// Create a manager with a custom log capacity (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            storage: RwLock::new(AlertStorage::default()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a handler for one alert type
    pub fn register_handler(&self, alert_type: AlertType, handler: Arc<dyn AlertHandler>) {
        self.handlers
            .write()
            .entry(alert_type)
            .or_default()
            .push(handler);
        debug!(alert_type = %alert_type, "Registered alert handler");
    }

    /// Register a handler for every alert type
    pub fn register_handler_for_all(&self, handler: Arc<dyn AlertHandler>) {
        for alert_type in [
            AlertType::HighMemoryUsage,
            AlertType::CriticalMemoryUsage,
            AlertType::LowHitRate,
            AlertType::HighLatency,
            AlertType::HighEvictionRate,
            AlertType::MemoryFragmentation,
            AlertType::BackendUnavailable,
        ] {
            self.register_handler(alert_type, Arc::clone(&handler));
        }
    }

    /// Record an alert and fan it out to registered handlers.
    ///
    /// Handlers are spawned on the current tokio runtime; outside a runtime
    /// the alert is still recorded but no handler runs.
    pub fn trigger_alert(&self, alert_type: AlertType, message: impl Into<String>) -> Alert {
        let alert = Alert::new(alert_type, message);

        {
            let mut storage = self.storage.write();
            storage.stats.total_alerts += 1;
            *storage.stats.alerts_by_type.entry(alert_type).or_insert(0) += 1;
            *storage
                .stats
                .alerts_by_severity
                .entry(alert.severity)
                .or_insert(0) += 1;
            storage.stats.last_alert = Some(alert.timestamp);

            storage.history.push_back(alert.clone());
            while storage.history.len() > self.capacity {
                storage.history.pop_front();
            }
        }

        let handlers = self
            .handlers
            .read()
            .get(&alert_type)
            .cloned()
            .unwrap_or_default();
        if !handlers.is_empty() {
            match Handle::try_current() {
                Ok(runtime) => {
                    for handler in handlers {
                        let alert = alert.clone();
                        runtime.spawn(async move { handler.handle(alert).await });
                        self.storage.write().stats.dispatched += 1;
                    }
                }
                Err(_) => {
                    warn!(alert_type = %alert_type, "No tokio runtime, alert handlers skipped")
                }
            }
        }

        debug!(alert_id = %alert.id, alert_type = %alert_type, "Alert triggered");
        alert
    }

    /// Trigger only if no unresolved alert of this type exists
    pub fn raise_once(&self, alert_type: AlertType, message: impl Into<String>) -> Option<Alert> {
        if self.is_active(alert_type) {
            None
        } else {
            Some(self.trigger_alert(alert_type, message))
        }
    }

    /// Mark every open alert of a type resolved, returning how many changed
    pub fn resolve(&self, alert_type: AlertType) -> usize {
        let now = Utc::now();
        let mut storage = self.storage.write();
        let mut resolved = 0;
        for alert in storage
            .history
            .iter_mut()
            .filter(|a| a.alert_type == alert_type && !a.resolved)
        {
            alert.resolved = true;
            alert.resolved_at = Some(now);
            resolved += 1;
        }
        storage.stats.resolved_alerts += resolved as u64;
        if resolved > 0 {
            info!(alert_type = %alert_type, resolved, "Alerts resolved");
        }
        resolved
    }

    /// True if an unresolved alert of this type is in the log
    pub fn is_active(&self, alert_type: AlertType) -> bool {
        self.storage
            .read()
            .history
            .iter()
            .any(|a| a.alert_type == alert_type && !a.resolved)
    }

    /// Most recent alerts first, up to `limit` (default 100)
    pub fn history(&self, limit: Option<usize>) -> Vec<Alert> {
        let limit = limit.unwrap_or(100);
        self.storage
            .read()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Unresolved alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.storage
            .read()
            .history
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AlertStats {
        self.storage.read().stats.clone()
    }

    /// Alerts currently held in the log
    pub fn len(&self) -> usize {
        self.storage.read().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
