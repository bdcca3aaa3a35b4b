//! Error types for the lead qualifier.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
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

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub(crate) fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// Email transport and notification errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport {name} fetch failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send on transport {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed for transport {name}: {reason}")]
    AuthFailed { name: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} is not configured: {hint}")]
    NotConfigured { provider: String, hint: String },

    #[error("All providers failed: {}", .reasons.join("; "))]
    AllProvidersFailed { reasons: Vec<String> },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Configuration problems are fatal and must not be retried on another provider.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::NotConfigured { .. })
    }
}

/// Human-approval errors.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Pending response {id} not found")]
    NotFound { id: Uuid },

    #[error("Pending response {id} already {status}, cannot {action}")]
    NotPending {
        id: Uuid,
        status: String,
        action: String,
    },

    #[error("Edited text for pending response {id} is empty")]
    EmptyEdit { id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Inbound processing errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Unknown thread {subject} for {email}")]
    UnknownThread { email: String, subject: String },

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
