//! tiercache - Tiered TTL Cache Engine
//!
//! A caching layer in front of a Redis-compatible backing store with an
//! in-process mirror. Every key is tagged with a [`DataType`] whose TTL
//! policy decides how long it stays fresh; a background analyzer tunes those
//! policies from store telemetry, and targeted invalidation removes keys from
//! both tiers on demand.
//!
//! # Architecture
//!
//! ```text
//! caller ─▶ CacheEngine ─▶ TieredCache ─▶ Mirror ─▶ BackingStore
//!                │              ▲
//!                │              └── UsageAnalyzer (analysis loop)
//!                ├─▶ InvalidationManager ─▶ strategies ─▶ both tiers
//!                └─▶ MetricsCollector (metrics loop) ─▶ AlertManager
//! ```
//!
//! # Modules
//!
//! - [`analyzer`] - Usage statistics and TTL recommendations
//! - [`cache`] - Policy store, mirror and the tiered read/write path
//! - [`config`] - YAML configuration and duration parsing
//! - [`engine`] - Facade owning the background loops
//! - [`error`] - Error types
//! - [`invalidation`] - Pattern, event, version and idle-time invalidation
//! - [`monitoring`] - Metrics snapshots, memory monitoring, alerts, health
//! - [`store`] - Backing store port and adapters

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod invalidation;
pub mod monitoring;
pub mod store;

// Re-export commonly used types
pub use analyzer::{AnalyzerConfig, TtlOptimization, UsageAnalyzer, UsageStats};
pub use cache::{DataType, PolicyStore, TieredCache};
pub use config::{parse_duration, EngineConfig};
pub use engine::CacheEngine;
pub use error::{Error, Result};
pub use invalidation::{InvalidationManager, InvalidationRequest, InvalidationStrategy};
pub use monitoring::{Alert, AlertHandler, AlertManager, AlertType, MetricData, MetricsCollector};
pub use store::{BackingStore, InMemoryBackingStore};
#[cfg(feature = "redis")]
pub use store::RedisBackingStore;
