//! External store collaborators
//!
//! The realtime core does not own persistence. Tenant/environment/agent
//! configuration lives in a relational store and conversations/messages in
//! a document store; both are reached through these traits. A Postgres
//! adapter is provided for the tenant side; the conversation side ships an
//! in-memory implementation and takes its production adapter from the
//! embedding deployment.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use uuid::Uuid;

use livedesk_shared::{ConversationStatus, CoreError, CoreResult, EnvKind, MessageKind};

pub use memory::{MemoryConversationStore, MemoryTenantStore};
pub use postgres::PgTenantStore;

// =============================================================================
// Records
// =============================================================================

/// Environment row: the unit of tenant scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub kind: EnvKind,
    pub plugin_key: String,
    pub api_key: String,
    pub api_secret_hash: String,
    pub allowed_origins: Vec<String>,
    pub is_active: bool,
    /// Per-environment overrides; None falls back to server defaults.
    pub connection_rate_per_minute: Option<u32>,
    pub message_rate_per_minute: Option<u32>,
}

/// Agent row: dashboard identity and routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub role: String,
    pub is_active: bool,
    /// Maximum concurrently assigned conversations; None falls back to the
    /// server default.
    pub concurrency_limit: Option<u32>,
}

/// Conversation reference as persisted by the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub env_id: Uuid,
    /// Widget-side end-user identifier (opaque to the core).
    pub end_user_id: String,
    pub status: ConversationStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Who authored a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sender {
    User { id: String },
    Agent { id: Uuid },
    Backend,
    System,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub org_id: Uuid,
    /// Strictly increasing, gap-free per conversation.
    pub seq: i64,
    pub sender: Sender,
    pub message_kind: MessageKind,
    pub content: String,
    pub is_internal: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Traits
// =============================================================================

/// Relational store reads for tenant/environment/agent configuration.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn environment_by_plugin_key(&self, key: &str) -> CoreResult<Option<EnvironmentRecord>>;

    async fn environment_by_api_key(&self, key: &str) -> CoreResult<Option<EnvironmentRecord>>;

    async fn environment_by_id(&self, env_id: Uuid) -> CoreResult<Option<EnvironmentRecord>>;

    /// The organization's default environment of the given kind. Agents
    /// operate in their organization's production environment.
    async fn default_environment(
        &self,
        org_id: Uuid,
        kind: EnvKind,
    ) -> CoreResult<Option<EnvironmentRecord>>;

    async fn agent_by_id(&self, agent_id: Uuid) -> CoreResult<Option<AgentRecord>>;

    async fn organization_active(&self, org_id: Uuid) -> CoreResult<bool>;
}

/// Document store operations the router needs. Writes are fire-and-confirm:
/// a message is not considered delivered until `append_message` returns Ok.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, org_id: Uuid, conversation_id: Uuid)
        -> CoreResult<Option<ConversationRecord>>;

    async fn create(&self, record: ConversationRecord) -> CoreResult<()>;

    /// Returns false when the conversation does not exist.
    async fn update_status(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> CoreResult<bool>;

    async fn set_assigned_agent(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> CoreResult<bool>;

    async fn append_message(&self, message: &MessageRecord) -> CoreResult<()>;

    async fn waiting_conversations(&self, org_id: Uuid) -> CoreResult<Vec<ConversationRecord>>;

    /// Active conversations whose last activity (latest message, or
    /// creation when none) predates the cutoff. Feeds the inactivity close.
    async fn idle_active_conversations(
        &self,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<ConversationRecord>>;

    /// Mark messages read up to a sequence number; returns the count newly
    /// marked.
    async fn mark_read(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        reader: &Sender,
        up_to_seq: Option<i64>,
    ) -> CoreResult<i64>;
}

// =============================================================================
// Retry helper
// =============================================================================

/// Retry an idempotent read a small bounded number of times before
/// surfacing `DependencyUnavailable`. Non-dependency errors pass through
/// immediately.
pub async fn retry_read<T, F, Fut>(op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(50).factor(2).take(2);
    RetryIf::spawn(strategy, op, |e: &CoreError| {
        matches!(e, CoreError::DependencyUnavailable(_))
    })
    .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_read_recovers_from_transient_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let result = retry_read(move || {
            let a = Arc::clone(&a);
            async move {
                if a.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoreError::DependencyUnavailable("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_read_gives_up_after_bounded_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let result: CoreResult<()> = retry_read(move || {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::DependencyUnavailable("down".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(CoreError::DependencyUnavailable(_))));
        // initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_read_does_not_retry_permanent_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let result: CoreResult<()> = retry_read(move || {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::UnknownTenant)
            }
        })
        .await;
        assert!(matches!(result, Err(CoreError::UnknownTenant)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
