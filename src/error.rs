//! Error types for the tiered cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    /// Backing store unreachable (connection refused, dropped, timed out)
    #[error("Backing store unreachable: {0}")]
    Connectivity(String),

    /// Backing store rejected a command for a reason other than connectivity
    #[error("Backing store error: {0}")]
    Backend(String),

    /// Invalid caller-supplied argument, rejected before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown data type name
    #[error("Unknown data type: {0}")]
    UnknownDataType(String),

    /// Sampling for one data type failed during an analysis cycle
    #[error("Analysis of {data_type} failed: {reason}")]
    PartialAnalysisFailure { data_type: String, reason: String },

    /// Unregistered invalidation strategy requested
    #[error("Invalidation strategy not found: {0}")]
    StrategyNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an `InvalidArgument` error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// True for errors caused by the caller (4xx class for an HTTP layer)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::UnknownDataType(_) | Error::DurationParse(_)
        )
    }

    /// True when the backing store could not be reached
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics registry: {}", e))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            Error::Connectivity(e.to_string())
        } else {
            Error::Backend(e.to_string())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::invalid_argument("empty key").is_client_error());
        assert!(Error::UnknownDataType("blob".into()).is_client_error());
        assert!(!Error::Connectivity("refused".into()).is_client_error());
        assert!(!Error::StrategyNotFound("lru".into()).is_client_error());
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::Connectivity("refused".into()).is_connectivity());
        assert!(!Error::Backend("WRONGTYPE".into()).is_connectivity());
    }

    #[test]
    fn test_error_display() {
        let err = Error::PartialAnalysisFailure {
            data_type: "statistics".into(),
            reason: "scan failed".into(),
        };
        assert_eq!(err.to_string(), "Analysis of statistics failed: scan failed");
    }
}
