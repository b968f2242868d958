//! Core error taxonomy
//!
//! Every failure in the realtime core is scoped to one connection or one
//! operation; nothing here is allowed to take the process down.

use uuid::Uuid;

/// Realtime core error type
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // Authentication (connection refused, no session created)
    #[error("Invalid credential")]
    InvalidCredential,
    #[error("Credential has expired")]
    ExpiredCredential,
    #[error("Credential has been revoked")]
    RevokedCredential,
    #[error("Unknown tenant")]
    UnknownTenant,

    // Authorization (valid principal, disallowed scope/action)
    #[error("Access denied: {0}")]
    Forbidden(String),

    // Connection state machine
    #[error("Connection is not ready for events")]
    NotReady,
    #[error("Invalid event in current state: {0}")]
    State(String),

    // Conversation lifecycle
    #[error("Conversation {0} is closed")]
    ConversationClosed(Uuid),
    #[error("Unknown conversation {0}")]
    UnknownConversation(Uuid),
    #[error("Session is not a member of conversation {0}")]
    NotInRoom(Uuid),

    // Admission
    #[error("Too many requests")]
    RateLimited,
    #[error("Connection temporarily banned")]
    Banned,

    // Dependencies
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    // Validation
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl CoreError {
    /// Stable machine-readable code for outbound error events.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidCredential => "INVALID_CREDENTIAL",
            CoreError::ExpiredCredential => "EXPIRED_CREDENTIAL",
            CoreError::RevokedCredential => "REVOKED_CREDENTIAL",
            CoreError::UnknownTenant => "UNKNOWN_TENANT",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::NotReady => "NOT_READY",
            CoreError::State(_) => "STATE_ERROR",
            CoreError::ConversationClosed(_) => "CONVERSATION_CLOSED",
            CoreError::UnknownConversation(_) => "UNKNOWN_CONVERSATION",
            CoreError::NotInRoom(_) => "NOT_IN_ROOM",
            CoreError::RateLimited => "RATE_LIMITED",
            CoreError::Banned => "BANNED",
            CoreError::DependencyUnavailable(_) => "DEPENDENCY_UNAVAILABLE",
            CoreError::DeliveryFailed(_) => "DELIVERY_FAILED",
            CoreError::BadRequest(_) => "BAD_REQUEST",
        }
    }

    /// Authentication failures refuse the connection outright; everything
    /// else is reported to the sender and the connection stays up.
    pub fn refuses_connection(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidCredential
                | CoreError::ExpiredCredential
                | CoreError::RevokedCredential
                | CoreError::UnknownTenant
                | CoreError::Banned
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = ?err, "relational store error");
        match err {
            sqlx::Error::RowNotFound => CoreError::UnknownTenant,
            other => CoreError::DependencyUnavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(error = ?err, "shared cache error");
        CoreError::DependencyUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::BadRequest(err.to_string())
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
