//! Data Type Categories
//!
//! Every cached key is tagged with a [`DataType`] at write time. The tag
//! selects the TTL policy and the key patterns used to sample the category.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Closed set of cached data categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// Template defaults and fallback values
    #[serde(rename = "default_values")]
    DefaultValues,
    /// Aggregate statistics
    #[serde(rename = "statistics")]
    Statistics,
    /// Inference results and model artifacts
    #[serde(rename = "ml_models")]
    MLModels,
    /// Configuration documents
    #[serde(rename = "configuration")]
    Configuration,
    /// Per-user session and preference data
    #[serde(rename = "user_sessions")]
    UserSessions,
}

impl DataType {
    /// Number of categories
    pub const COUNT: usize = 5;

    /// All categories, in analysis order
    pub const ALL: [DataType; Self::COUNT] = [
        DataType::DefaultValues,
        DataType::Statistics,
        DataType::MLModels,
        DataType::Configuration,
        DataType::UserSessions,
    ];

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::DefaultValues => "default_values",
            DataType::Statistics => "statistics",
            DataType::MLModels => "ml_models",
            DataType::Configuration => "configuration",
            DataType::UserSessions => "user_sessions",
        }
    }

    /// Built-in TTL policy
    pub fn default_ttl(&self) -> Duration {
        match self {
            DataType::DefaultValues => Duration::from_secs(60 * 60),
            DataType::Statistics => Duration::from_secs(24 * 60 * 60),
            DataType::MLModels => Duration::from_secs(60 * 60),
            DataType::Configuration => Duration::from_secs(30 * 60),
            DataType::UserSessions => Duration::from_secs(2 * 60 * 60),
        }
    }

    /// Built-in key patterns used to enumerate keys of this category
    pub fn default_key_patterns(&self) -> Vec<String> {
        let patterns: &[&str] = match self {
            DataType::DefaultValues => &["default:*"],
            DataType::Statistics => &["stats:*"],
            DataType::MLModels => &["model:*", "ml:*"],
            DataType::Configuration => &["config:*"],
            DataType::UserSessions => &["session:*", "user:*"],
        };
        patterns.iter().map(|p| p.to_string()).collect()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.as_str() == normalized)
            .ok_or_else(|| Error::UnknownDataType(s.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
