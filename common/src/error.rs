//! Error kinds shared by every netfence crate

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FenceError>;

/// Failure kinds surfaced by the store, the access layer and the engine
#[derive(Debug, Error)]
pub enum FenceError {
    /// Malformed record, unknown tag or disallowed cross-subscription reference
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// 429/504 still failing after the retry budget was spent
    #[error("request to {url} still failing with status {status} after {attempts} attempts")]
    Transient {
        url: String,
        status: u16,
        attempts: u32,
    },

    /// Provider rule-count cap or Front Door instance cap
    #[error("capacity exceeded for {resource}: {count} entries, limit is {limit}")]
    CapacityExceeded {
        resource: String,
        count: usize,
        limit: usize,
    },

    #[error("{operation} is not supported for {resource_type}")]
    Unsupported {
        operation: String,
        resource_type: String,
    },

    /// Terminal non-success status from a REST call
    #[error("request to {url} failed with status {status}: {body}")]
    Http {
        url: String,
        status: u16,
        body: String,
    },

    /// Connection-level failure before any status was received
    #[error("request to {url} could not be sent: {message}")]
    Connection { url: String, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FenceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn unsupported(operation: &str, resource_type: &str) -> Self {
        Self::Unsupported {
            operation: operation.to_string(),
            resource_type: resource_type.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Message safe to show to callers. Transient and connection failures keep
    /// the URL for correlation but drop response bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Http { url, status, .. } => format!("request to {url} failed with status {status}"),
            Self::Store(_) => "document store operation failed".to_string(),
            other => other.to_string(),
        }
    }
}
