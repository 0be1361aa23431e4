//! Error types for mnemo

use thiserror::Error;

/// Result type alias for mnemo operations
pub type Result<T> = std::result::Result<T, MnemoError>;

/// Main error type for mnemo
///
/// Every user-visible failure maps onto a stable machine-readable kind via
/// [`MnemoError::kind`]; transports derive status codes from it instead of
/// matching on variants.
#[derive(Error, Debug)]
pub enum MnemoError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Operation '{operation}' timed out after {budget_ms}ms")]
    Timeout {
        operation: &'static str,
        budget_ms: u64,
    },

    #[error("Embedding dimension mismatch: store has {stored}, provider produces {provider}")]
    DimensionMismatch { stored: usize, provider: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl PartialEq for MnemoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidInput(a), Self::InvalidInput(b)) => a == b,
            (Self::NotFound(a), Self::NotFound(b)) => a == b,
            (Self::BackendUnavailable(a), Self::BackendUnavailable(b)) => a == b,
            (
                Self::Timeout {
                    operation: a_op,
                    budget_ms: a_ms,
                },
                Self::Timeout {
                    operation: b_op,
                    budget_ms: b_ms,
                },
            ) => a_op == b_op && a_ms == b_ms,
            (
                Self::DimensionMismatch {
                    stored: a_s,
                    provider: a_p,
                },
                Self::DimensionMismatch {
                    stored: b_s,
                    provider: b_p,
                },
            ) => a_s == b_s && a_p == b_p,
            (Self::Unauthorized(a), Self::Unauthorized(b)) => a == b,
            (Self::ResourceExhausted(a), Self::ResourceExhausted(b)) => a == b,
            (Self::Embedding(a), Self::Embedding(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            (Self::Serialization(a), Self::Serialization(b)) => a.to_string() == b.to_string(),
            (Self::Io(a), Self::Io(b)) => a.to_string() == b.to_string(),
            (Self::Http(a), Self::Http(b)) => a.to_string() == b.to_string(),
            (Self::Config(a), Self::Config(b)) => a == b,
            (
                Self::Internal {
                    correlation_id: a_id,
                    message: a_msg,
                },
                Self::Internal {
                    correlation_id: b_id,
                    message: b_msg,
                },
            ) => a_id == b_id && a_msg == b_msg,
            _ => false,
        }
    }
}

impl MnemoError {
    /// Build an `Internal` error with a fresh correlation id.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable kind, used in wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::BackendUnavailable(_) | Self::Http(_) => "backend_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Unauthorized(_) => "unauthorized",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Embedding(_)
            | Self::Database(_)
            | Self::Serialization(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Internal { .. } => "internal",
        }
    }

    /// Check if the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::Http(_) | Self::Timeout { .. }
        )
    }

    /// HTTP status code for the coordinator surface.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            "invalid_input" => 400,
            "not_found" => 404,
            "unauthorized" => 401,
            "resource_exhausted" => 429,
            "backend_unavailable" => 503,
            "timeout" => 504,
            _ => 500,
        }
    }

    /// JSON-RPC error code for the stdio transport.
    pub fn rpc_code(&self) -> i64 {
        match self.kind() {
            "invalid_input" => -32602,
            "not_found" => -32001,
            "unauthorized" => -32003,
            "resource_exhausted" => -32004,
            "timeout" => -32008,
            "backend_unavailable" => -32011,
            "dimension_mismatch" => -32010,
            _ => -32000,
        }
    }

    /// Reconstruct a taxonomy error from a wire `kind` + message.
    ///
    /// Used by the federated backend to surface coordinator errors unchanged.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "invalid_input" => Self::InvalidInput(message),
            "not_found" => Self::NotFound(message),
            "unauthorized" => Self::Unauthorized(message),
            "resource_exhausted" => Self::ResourceExhausted(message),
            "backend_unavailable" => Self::BackendUnavailable(message),
            "timeout" => Self::Timeout {
                operation: "remote",
                budget_ms: 0,
            },
            _ => Self::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable() {
        assert_eq!(MnemoError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(MnemoError::NotFound("abc".into()).kind(), "not_found");
        assert_eq!(
            MnemoError::DimensionMismatch {
                stored: 384,
                provider: 768
            }
            .kind(),
            "dimension_mismatch"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(MnemoError::InvalidInput("x".into()).http_status(), 400);
        assert_eq!(MnemoError::NotFound("x".into()).http_status(), 404);
        assert_eq!(MnemoError::Unauthorized("x".into()).http_status(), 401);
        assert_eq!(
            MnemoError::BackendUnavailable("x".into()).http_status(),
            503
        );
        assert_eq!(
            MnemoError::Timeout {
                operation: "store",
                budget_ms: 10_000
            }
            .http_status(),
            504
        );
        assert_eq!(MnemoError::internal("boom").http_status(), 500);
    }

    #[test]
    fn retryable_errors() {
        assert!(MnemoError::BackendUnavailable("down".into()).is_retryable());
        assert!(!MnemoError::InvalidInput("bad".into()).is_retryable());
        assert!(!MnemoError::internal("boom").is_retryable());
    }

    #[test]
    fn round_trip_from_kind() {
        let err = MnemoError::NotFound("abc".into());
        let rebuilt = MnemoError::from_kind(err.kind(), "abc".into());
        assert_eq!(rebuilt.kind(), "not_found");
    }
}
