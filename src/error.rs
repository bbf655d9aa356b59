//! Error types for the job pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl Error {
    /// Storage-class failures: the store or queue could not be reached.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Queue(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue operation failed: {0}")]
    OperationFailed(String),

    #[error("Malformed task payload: {0}")]
    Payload(String),
}

/// Model agent errors, classified for the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Transient failure from {provider}: {reason}")]
    Transient { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("{0}")]
    Unclassified(String),
}

impl AgentError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. }
            | Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::Unclassified(_) => true,
            Self::Validation(_) | Self::AuthFailed { .. } => false,
        }
    }

    /// Provider-supplied minimum wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Job-related errors surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {status}; only failed jobs can be retried")]
    NotRetryable { id: Uuid, status: String },

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_classification() {
        assert!(
            AgentError::Transient {
                provider: "gemini".into(),
                reason: "connection reset".into()
            }
            .is_retryable()
        );
        assert!(AgentError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(AgentError::Unclassified("boom".into()).is_retryable());
        assert!(!AgentError::Validation("bad model".into()).is_retryable());
        assert!(
            !AgentError::AuthFailed {
                provider: "gemini".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let err = AgentError::RateLimited {
            provider: "gemini".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(AgentError::Timeout(Duration::from_secs(1)).retry_after(), None);
    }

    #[test]
    fn storage_errors_are_flagged() {
        let err: Error = DatabaseError::Query("locked".into()).into();
        assert!(err.is_storage());
        let err: Error = AgentError::Validation("x".into()).into();
        assert!(!err.is_storage());
    }
}
