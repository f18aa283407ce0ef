//! Metrics & Alerting
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      MetricsCollector                            │
//! │   INFO + PING + per-type SCAN  ──▶  MetricData (latest/history)  │
//! │          │                               │                       │
//! │          ▼                               ▼                       │
//! │  ┌────────────────┐            threshold checks                  │
//! │  │ MemoryMonitor  │            (hit rate, latency, evictions)    │
//! │  └────────────────┘                      │                       │
//! │          └───────────────┬───────────────┘                       │
//! │                          ▼                                       │
//! │                  ┌───────────────┐     ┌──────────────────────┐  │
//! │                  │ AlertManager  │ ──▶ │ handlers (spawned)   │  │
//! │                  │ FIFO ring     │     └──────────────────────┘  │
//! │                  └───────────────┘                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Threshold alerts are edge-triggered: raised once when a threshold is
//! crossed and resolved when the metric recovers.

pub mod alerts;
mod collector;
mod health;
mod memory;
mod proptest;

pub use alerts::{
    Alert, AlertHandler, AlertManager, AlertSeverity, AlertStats, AlertType, FnAlertHandler,
    LoggingAlertHandler, DEFAULT_ALERT_CAPACITY,
};
pub use collector::{CollectorConfig, DataTypeMetrics, MetricData, MetricsCollector};
pub use health::{HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};
pub use memory::{MemoryConfig, MemoryLevel, MemoryMonitor, MemoryStats};
