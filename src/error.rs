//! Error types for workflow-core.

use thiserror::Error;

/// Result type alias using workflow-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during workflow execution.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or input precondition violated; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation exceeded its configured time bound
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Retry-worthy downstream failure
    #[error("Transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Downstream definitively failed; not worth retrying
    #[error("Permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Circuit breaker is rejecting traffic
    #[error("Circuit open: {consecutive_failures} consecutive failures, retry after {retry_after_ms}ms")]
    CircuitOpen {
        consecutive_failures: u32,
        retry_after_ms: u64,
    },

    /// Router found no route for the selected key
    #[error("Routing error: no route for key '{key}'")]
    Routing { key: String },

    /// Adaptive layer could not apply a strategy
    #[error("Strategy error: {0}")]
    Strategy(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Strategy store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient error with source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Create a permanent error with source.
    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a routing error for an unmatched key.
    pub fn routing(key: impl Into<String>) -> Self {
        Self::Routing { key: key.into() }
    }

    /// Create a strategy error.
    pub fn strategy(message: impl Into<String>) -> Self {
        Self::Strategy(message.into())
    }

    /// Whether a retry policy may re-attempt after this error.
    ///
    /// Validation and permanent failures are never retried; circuit
    /// rejections are treated as transient by upper layers.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::CircuitOpen { .. }
        )
    }

    /// Short stable label for metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Routing { .. } => "routing",
            Self::Strategy(_) => "strategy",
            Self::Serialization(_) => "serialization",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriability() {
        assert!(Error::transient("503").is_retriable());
        assert!(Error::timeout(500).is_retriable());
        assert!(Error::CircuitOpen {
            consecutive_failures: 5,
            retry_after_ms: 1000
        }
        .is_retriable());

        assert!(!Error::validation("bad config").is_retriable());
        assert!(!Error::permanent("404").is_retriable());
        assert!(!Error::routing("unknown").is_retriable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Error::transient("x").kind(), "transient");
        assert_eq!(Error::timeout(10).kind(), "timeout");
        assert_eq!(Error::routing("k").kind(), "routing");
    }

    #[test]
    fn test_source_chain_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = Error::transient_with_source("connection dropped", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
