//! Engine Configuration
//!
//! Typed configuration loaded from YAML. Every section has a `Default`, so an
//! empty document (or no document at all) yields the built-in settings.
//!
//! ```yaml
//! policies:
//!   user_sessions: 2h
//!   configuration: 30m
//! analysis_interval: 60s
//! max_ttl: 30d
//! analyzer:
//!   sample_size: 100
//!   auto_apply_confidence: 0.7
//! collector:
//!   interval: 30s
//!   min_hit_rate: 0.8
//! memory:
//!   max_memory_mb: 512
//! key_patterns:
//!   user_sessions: ["session:*", "user:*"]
//! invalidation:
//!   idle_thresholds:
//!     "session:*": 30m
//!   events:
//!     config_reloaded: ["config:*"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerConfig;
use crate::cache::{DataType, PolicyStore, DEFAULT_ANALYSIS_INTERVAL, DEFAULT_MAX_TTL};
use crate::error::{Error, Result};
use crate::monitoring::{CollectorConfig, MemoryConfig, DEFAULT_ALERT_CAPACITY};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TTL per data type as a duration string ("30m", "2h")
    pub policies: BTreeMap<DataType, String>,
    /// Interval between TTL analysis passes
    #[serde(with = "duration_str")]
    pub analysis_interval: Duration,
    /// Upper bound on any policy TTL, configured or recommended
    #[serde(with = "duration_str")]
    pub max_ttl: Duration,
    /// Usage analyzer settings
    pub analyzer: AnalyzerConfig,
    /// Metrics collector settings
    pub collector: CollectorConfig,
    /// Memory thresholds
    pub memory: MemoryConfig,
    /// Key globs enumerating each data type
    pub key_patterns: BTreeMap<DataType, Vec<String>>,
    /// Alert log capacity
    pub alert_capacity: usize,
    /// Strategy registrations applied at startup
    pub invalidation: InvalidationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policies: DataType::ALL
                .iter()
                .map(|dt| (*dt, format_duration(dt.default_ttl())))
                .collect(),
            analysis_interval: DEFAULT_ANALYSIS_INTERVAL,
            max_ttl: DEFAULT_MAX_TTL,
            analyzer: AnalyzerConfig::default(),
            collector: CollectorConfig::default(),
            memory: MemoryConfig::default(),
            key_patterns: DataType::ALL
                .iter()
                .map(|dt| (*dt, dt.default_key_patterns()))
                .collect(),
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            invalidation: InvalidationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig = if raw.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.max_ttl.is_zero() {
            return Err(Error::Config("max_ttl must be positive".into()));
        }
        if let Some((dt, ttl)) = self
            .parsed_policies()?
            .into_iter()
            .find(|(_, ttl)| *ttl > self.max_ttl)
        {
            return Err(Error::Config(format!(
                "policies.{} ({}) exceeds max_ttl ({})",
                dt,
                format_duration(ttl),
                format_duration(self.max_ttl)
            )));
        }

        if self.analysis_interval.is_zero() {
            return Err(Error::Config("analysis_interval must be positive".into()));
        }
        if self.collector.interval.is_zero() {
            return Err(Error::Config("collector.interval must be positive".into()));
        }
        if !(self.collector.max_latency_ms > 0.0) {
            return Err(Error::Config("collector.max_latency_ms must be positive".into()));
        }
        if self.analyzer.sample_size == 0 {
            return Err(Error::Config("analyzer.sample_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.analyzer.auto_apply_confidence) {
            return Err(Error::Config(
                "analyzer.auto_apply_confidence must be within [0, 1]".into(),
            ));
        }
        if self.alert_capacity == 0 {
            return Err(Error::Config("alert_capacity must be positive".into()));
        }
        if self.memory.warning_threshold >= self.memory.critical_threshold {
            return Err(Error::Config(format!(
                "memory.warning_threshold ({}) must be below memory.critical_threshold ({})",
                self.memory.warning_threshold, self.memory.critical_threshold
            )));
        }
        if let Some((dt, _)) = self.key_patterns.iter().find(|(_, p)| p.is_empty()) {
            return Err(Error::Config(format!("key_patterns.{} must not be empty", dt)));
        }
        self.invalidation.parsed_idle_thresholds()?;
        if let Some((event, _)) = self
            .invalidation
            .events
            .iter()
            .find(|(event, patterns)| event.is_empty() || patterns.is_empty())
        {
            return Err(Error::Config(format!(
                "invalidation.events.{:?} needs a name and at least one pattern",
                event
            )));
        }
        Ok(())
    }

    /// Policies parsed into durations
    pub fn parsed_policies(&self) -> Result<HashMap<DataType, Duration>> {
        self.policies
            .iter()
            .map(|(dt, raw)| {
                parse_duration(raw)
                    .map(|ttl| (*dt, ttl))
                    .map_err(|e| Error::Config(format!("policies.{}: {}", dt, e)))
            })
            .collect()
    }

    /// Build the policy store.
    ///
    /// `DefaultValues` is always present so lookups for unconfigured types
    /// have something to fall back to.
    pub fn policy_store(&self) -> Result<PolicyStore> {
        let mut policies = self.parsed_policies()?;
        policies
            .entry(DataType::DefaultValues)
            .or_insert_with(|| DataType::DefaultValues.default_ttl());
        PolicyStore::with_policies(policies, self.max_ttl)
    }

    /// Analyzer settings with the shared key patterns applied
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        let mut analyzer = self.analyzer.clone();
        analyzer.key_patterns = self.key_patterns.clone();
        analyzer
    }
}

/// Invalidation strategy registrations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Maximum idle time per key glob
    pub idle_thresholds: BTreeMap<String, String>,
    /// Key globs bound to each event name
    pub events: BTreeMap<String, Vec<String>>,
}

impl InvalidationConfig {
    /// Idle thresholds parsed into durations
    pub fn parsed_idle_thresholds(&self) -> Result<Vec<(String, Duration)>> {
        self.idle_thresholds
            .iter()
            .map(|(pattern, raw)| {
                if pattern.is_empty() {
                    return Err(Error::Config(
                        "invalidation.idle_thresholds has an empty pattern".into(),
                    ));
                }
                parse_duration(raw)
                    .map(|max_idle| (pattern.clone(), max_idle))
                    .map_err(|e| {
                        Error::Config(format!("invalidation.idle_thresholds.{}: {}", pattern, e))
                    })
            })
            .collect()
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a compact duration string ("1h", "30m", "1h30m", "90").
///
/// Units are `d`, `h`, `m` and `s` in either case; a trailing bare number
/// counts as seconds. Empty and zero durations are rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'd' | 'D' => 86400,
            'h' | 'H' => 3600,
            'm' | 'M' => 60,
            's' | 'S' => 1,
            _ => return Err(Error::DurationParse(format!("unknown duration unit: {}", c))),
        };
        total_secs = num
            .checked_mul(multiplier)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(|| Error::DurationParse(format!("duration overflow: {}", s)))?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs
            .checked_add(num)
            .ok_or_else(|| Error::DurationParse(format!("duration overflow: {}", s)))?;
    }

    if total_secs == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Render a duration in the largest unit that divides it evenly
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => "0s".to_string(),
        s if s % 86400 == 0 => format!("{}d", s / 86400),
        s if s % 3600 == 0 => format!("{}h", s / 3600),
        s if s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// Serde adapter for duration strings
pub mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // parse_duration Tests
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1d12h").unwrap(), Duration::from_secs(129600));
    }

    #[test]
    fn test_parse_duration_raw_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("  1h  ").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("abc"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("0h"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("1x"), Err(Error::DurationParse(_)));
        assert_matches!(
            parse_duration("99999999999999999999d"),
            Err(Error::DurationParse(_))
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(1800)), "30m");
        assert_eq!(format_duration(Duration::from_secs(86400)), "1d");
        assert_eq!(format_duration(Duration::from_secs(61)), "61s");
    }

    // =========================================================================
    // EngineConfig Tests
    // =========================================================================

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();

        let store = config.policy_store().unwrap();
        assert_eq!(store.get(DataType::UserSessions), Duration::from_secs(7200));
        assert_eq!(store.get(DataType::Statistics), Duration::from_secs(86400));
        assert_eq!(store.get(DataType::Configuration), Duration::from_secs(1800));
        assert_eq!(config.analysis_interval, Duration::from_secs(60));
        assert_eq!(config.collector.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.alert_capacity, 1000);
        assert_eq!(config.analyzer.sample_size, 100);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
policies:
  default_values: 10m
  user_sessions: 3h
analysis_interval: 5m
collector:
  interval: 15s
  min_hit_rate: 0.9
memory:
  max_memory_mb: 1024
key_patterns:
  user_sessions: ["sess:*"]
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.analysis_interval, Duration::from_secs(300));
        assert_eq!(config.collector.interval, Duration::from_secs(15));
        assert_eq!(config.collector.min_hit_rate, 0.9);
        assert_eq!(config.memory.max_memory_mb, 1024);
        assert_eq!(config.memory.warning_threshold, 0.70);

        let store = config.policy_store().unwrap();
        assert_eq!(store.get(DataType::UserSessions), Duration::from_secs(3 * 3600));
        // Unconfigured types fall back to the default policy
        assert_eq!(store.get(DataType::MLModels), Duration::from_secs(600));

        let analyzer = config.analyzer_config();
        assert_eq!(
            analyzer.patterns_for(DataType::UserSessions),
            vec!["sess:*".to_string()]
        );
        // Types missing from the map fall back to the built-in globs
        assert_eq!(
            analyzer.patterns_for(DataType::Statistics),
            DataType::Statistics.default_key_patterns()
        );
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let err = EngineConfig::from_yaml_str("policies:\n  statistics: 0s\n").unwrap_err();
        assert_matches!(err, Error::Config(msg) if msg.contains("statistics"));
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let err = EngineConfig::from_yaml_str("analysis_interval: soon\n").unwrap_err();
        assert_matches!(err, Error::Serialization(_));
    }

    #[test]
    fn test_unknown_data_type_rejected() {
        let err = EngineConfig::from_yaml_str("policies:\n  blobs: 1h\n").unwrap_err();
        assert_matches!(err, Error::Serialization(_));
    }

    #[test]
    fn test_max_ttl_bounds_policies() {
        let config = EngineConfig::from_yaml_str("max_ttl: 12h\npolicies:\n  statistics: 6h\n").unwrap();
        assert_eq!(config.max_ttl, Duration::from_secs(12 * 3600));
        let store = config.policy_store().unwrap();
        assert_eq!(store.max_ttl(), Duration::from_secs(12 * 3600));
        assert!(store.set(DataType::Statistics, Duration::from_secs(13 * 3600)).is_err());

        // Built-in statistics policy (24h) is above a 12h cap
        let err = EngineConfig::from_yaml_str("max_ttl: 12h\n").unwrap_err();
        assert_matches!(err, Error::Config(msg) if msg.contains("max_ttl"));
    }

    #[test]
    fn test_memory_thresholds_ordered() {
        let yaml = "memory:\n  warning_threshold: 0.9\n  critical_threshold: 0.8\n";
        assert_matches!(EngineConfig::from_yaml_str(yaml), Err(Error::Config(_)));
    }

    #[test]
    fn test_invalidation_section() {
        let yaml = r#"
invalidation:
  idle_thresholds:
    "session:*": 30m
  events:
    config_reloaded: ["config:*", "default:*"]
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.invalidation.parsed_idle_thresholds().unwrap(),
            vec![("session:*".to_string(), Duration::from_secs(1800))]
        );
        assert_eq!(config.invalidation.events["config_reloaded"].len(), 2);

        let bad = "invalidation:\n  idle_thresholds:\n    \"session:*\": never\n";
        assert_matches!(EngineConfig::from_yaml_str(bad), Err(Error::Config(_)));

        let empty_event = "invalidation:\n  events:\n    flush: []\n";
        assert_matches!(EngineConfig::from_yaml_str(empty_event), Err(Error::Config(_)));
    }

    #[test]
    fn test_config_roundtrips_through_yaml() {
        let config = EngineConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("analysis_interval: 1m"));
        let parsed = EngineConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.policies, config.policies);
    }
}
