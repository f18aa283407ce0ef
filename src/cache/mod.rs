//! Tiered TTL Cache
//!
//! Two-tier cache in front of the backing store:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Mirror (in-process)              │
//! │  RwLock<HashMap>, absolute expiry per key   │
//! └─────────────────────┬───────────────────────┘
//!                       │ miss / expired
//!                       ▼
//! ┌─────────────────────────────────────────────┐
//! │         Backing store (authoritative)       │
//! │  Redis or in-memory, real per-key expiry    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Every key is tagged with a [`DataType`] at write time; the [`PolicyStore`]
//! maps each type to its TTL.

pub mod data_type;
pub mod grants;
pub mod metrics;
pub mod mirror;
pub mod policy;
pub mod tiered;

pub use data_type::DataType;
pub use grants::GrantLog;
pub use metrics::{CacheMetrics, CacheMetricsSnapshot, LatencyTracker};
pub use mirror::{Mirror, MirrorEntry, MirrorLookup, MirrorStats};
pub use policy::{PolicyStore, DEFAULT_MAX_TTL};
pub use tiered::{
    AnalysisPass, CacheTelemetry, MirrorInvalidator, TieredCache, DEFAULT_ANALYSIS_INTERVAL,
};
