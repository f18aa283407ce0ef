//! Health Checks
//!
//! Probes the backing store and reports memory level and lifecycle state for
//! the `/healthz` endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::memory::{MemoryLevel, MemoryStats};
use crate::store::BackingStore;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status across all checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Health check manager
pub struct HealthCheck {
    start_time: Instant,
    /// Cleared when the engine shuts down
    live: AtomicBool,
    /// PING round trip above which the store is reported degraded
    max_latency: Duration,
}

impl HealthCheck {
    pub fn new(max_latency: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            max_latency,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Lifecycle check
    pub fn liveness_check(&self) -> HealthCheckResult {
        if self.is_live() {
            HealthCheckResult::healthy("lifecycle")
        } else {
            HealthCheckResult::unhealthy("lifecycle", "Engine closed")
        }
    }

    /// PING the backing store
    pub async fn store_check(&self, store: &dyn BackingStore) -> HealthCheckResult {
        let started = Instant::now();
        let result = match store.ping().await {
            Ok(rtt) if rtt > self.max_latency => HealthCheckResult::degraded(
                "backing_store",
                format!("PING took {}ms", rtt.as_millis()),
            ),
            Ok(_) => HealthCheckResult::healthy("backing_store"),
            Err(e) => HealthCheckResult::unhealthy("backing_store", e.to_string()),
        };
        result.with_duration(started.elapsed())
    }

    /// Memory level from the most recent reading
    pub fn memory_check(&self, memory: Option<&MemoryStats>) -> HealthCheckResult {
        match memory.map(|m| (m.level, m.usage_ratio)) {
            Some((MemoryLevel::Critical, ratio)) => HealthCheckResult::degraded(
                "memory",
                format!("Memory usage critical at {:.1}%", ratio * 100.0),
            ),
            _ => HealthCheckResult::healthy("memory"),
        }
    }

    /// Run all health checks
    pub async fn check_all(
        &self,
        store: &dyn BackingStore,
        memory: Option<&MemoryStats>,
    ) -> HealthResponse {
        let checks = vec![
            self.liveness_check(),
            self.store_check(store).await,
            self.memory_check(memory),
        ];
        HealthResponse::new(checks, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackingStore;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
    }

    #[test]
    fn test_health_response_worst_status_wins() {
        let checks = vec![
            HealthCheckResult::healthy("a"),
            HealthCheckResult::degraded("b", "slow"),
        ];
        let response = HealthResponse::new(checks, Duration::from_secs(60));
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.uptime_seconds, 60);

        let response = HealthResponse::new(vec![], Duration::ZERO);
        assert_eq!(response.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_check_all_healthy() {
        let store = InMemoryBackingStore::new();
        let health = HealthCheck::default();
        let response = health.check_all(&store, None).await;
        assert_eq!(response.status, HealthStatus::Healthy);
        assert_eq!(response.checks.len(), 3);
    }

    #[tokio::test]
    async fn test_store_down_is_unhealthy() {
        let store = InMemoryBackingStore::new();
        store.set_available(false);
        let health = HealthCheck::default();
        let response = health.check_all(&store, None).await;
        assert_eq!(response.status, HealthStatus::Unhealthy);
        let store_check = response
            .checks
            .iter()
            .find(|c| c.name == "backing_store")
            .unwrap();
        assert!(store_check.message.as_ref().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_critical_memory_is_degraded() {
        let store = InMemoryBackingStore::new();
        let health = HealthCheck::default();
        let memory = MemoryStats {
            usage_ratio: 0.9,
            level: MemoryLevel::Critical,
            ..Default::default()
        };
        let response = health.check_all(&store, Some(&memory)).await;
        assert_eq!(response.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_closed_engine_is_unhealthy() {
        let store = InMemoryBackingStore::new();
        let health = HealthCheck::default();
        health.set_live(false);
        let response = health.check_all(&store, None).await;
        assert_eq!(response.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_serialization() {
        let result = HealthCheckResult::healthy("test");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("Healthy"));
        let deserialized: HealthCheckResult = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.status, HealthStatus::Healthy);
    }
}
