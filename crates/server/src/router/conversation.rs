//! Conversation room authorization and message routing
//!
//! The router is the single authority for conversation state transitions
//! in this process. Joins are authorized against the principal's scope,
//! messages get a gap-free per-conversation sequence number from an atomic
//! cache increment, and a message is only fanned out after the document
//! store confirms the write.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use livedesk_shared::{ConversationStatus, CoreError, CoreResult, MessageKind, SharedCache};

use crate::auth::Principal;
use crate::presence::{ConnectionSession, SessionRegistry};
use crate::store::{
    retry_read, ConversationRecord, ConversationStore, MessageRecord, Sender, TenantStore,
};

use super::typing::TypingTracker;

/// Inclusive upper bound on message content length.
pub const MAX_CONTENT_LEN: usize = 10_000;

pub(super) fn seq_key(org_id: Uuid, conversation_id: Uuid) -> String {
    format!("seq:{org_id}:{conversation_id}")
}

pub(super) fn assigned_key(org_id: Uuid, agent_id: Uuid) -> String {
    format!("assigned:{org_id}:{agent_id}")
}

/// Map a principal onto the persisted sender shape.
pub(super) fn sender_for(principal: &Principal) -> Sender {
    match principal {
        Principal::EndUser { member_id, .. } => Sender::User {
            id: member_id.clone(),
        },
        Principal::Agent { id, .. } => Sender::Agent { id: *id },
        Principal::BackendService { .. } => Sender::Backend,
    }
}

/// Outcome of routing one message: the persisted record plus the sessions
/// it must be delivered to, in registry order.
pub struct RoutedMessage {
    pub record: MessageRecord,
    pub targets: Vec<Arc<ConnectionSession>>,
}

/// Routes conversation lifecycle and message traffic.
pub struct ConversationRouter {
    pub(super) conversations: Arc<dyn ConversationStore>,
    pub(super) tenants: Arc<dyn TenantStore>,
    pub(super) registry: Arc<SessionRegistry>,
    pub(super) cache: Arc<dyn SharedCache>,
    pub(super) typing: TypingTracker,
}

impl ConversationRouter {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        tenants: Arc<dyn TenantStore>,
        registry: Arc<SessionRegistry>,
        cache: Arc<dyn SharedCache>,
        typing: TypingTracker,
    ) -> Self {
        Self {
            conversations,
            tenants,
            registry,
            cache,
            typing,
        }
    }

    /// Load a conversation within the session's organization.
    pub(super) async fn load(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
    ) -> CoreResult<ConversationRecord> {
        retry_read(|| {
            let store = Arc::clone(&self.conversations);
            async move { store.get(org_id, conversation_id).await }
        })
        .await?
        .ok_or(CoreError::UnknownConversation(conversation_id))
    }

    fn authorize_join(
        session: &ConnectionSession,
        record: &ConversationRecord,
    ) -> CoreResult<()> {
        match &session.principal {
            Principal::EndUser { member_id, .. } => {
                // Widget users may only enter their own conversation, and
                // only within the environment their plugin key resolved to
                if record.end_user_id != *member_id || record.env_id != session.tenant.env_id {
                    return Err(CoreError::Forbidden(
                        "conversation belongs to another participant".to_string(),
                    ));
                }
            }
            Principal::BackendService { .. } => {
                if record.env_id != session.tenant.env_id {
                    return Err(CoreError::Forbidden(
                        "conversation belongs to another environment".to_string(),
                    ));
                }
            }
            // Agents see every conversation in their organization,
            // production and test environments alike
            Principal::Agent { .. } => {}
        }
        Ok(())
    }

    /// Authorize and perform a room join.
    pub async fn join(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
    ) -> CoreResult<ConversationRecord> {
        let record = self.load(session.tenant.org_id, conversation_id).await?;
        if record.status == ConversationStatus::Closed {
            return Err(CoreError::ConversationClosed(conversation_id));
        }
        Self::authorize_join(session, &record)?;
        self.registry
            .join_room(session.session_id, conversation_id)
            .await?;
        Ok(record)
    }

    /// Leave a room. Leaving a room you are not in is a no-op.
    pub async fn leave(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
    ) -> CoreResult<()> {
        self.registry
            .leave_room(session.session_id, conversation_id)
            .await
    }

    /// Register a freshly created conversation, notify the organization's
    /// agents, and attempt auto-assignment.
    pub async fn conversation_created(&self, record: ConversationRecord) -> CoreResult<()> {
        self.conversations.create(record.clone()).await?;
        self.registry
            .broadcast_org_agents(
                record.org_id,
                crate::dispatch::ServerEvent::NewChat {
                    conversation_id: record.id,
                    end_user_id: record.end_user_id.clone(),
                    created_at: record.created_at,
                },
            )
            .await;
        self.auto_assign(record.org_id, record.id).await?;
        Ok(())
    }

    /// Sequence, persist, and resolve delivery targets for one message.
    pub async fn route_message(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
        content: &str,
        is_internal: bool,
        message_kind: MessageKind,
    ) -> CoreResult<RoutedMessage> {
        if !session.in_room(conversation_id).await {
            return Err(CoreError::NotInRoom(conversation_id));
        }
        if content.is_empty() {
            return Err(CoreError::BadRequest("empty message content".to_string()));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(CoreError::BadRequest(format!(
                "message content exceeds {MAX_CONTENT_LEN} bytes"
            )));
        }
        if is_internal && !session.principal.can_author_internal_notes() {
            return Err(CoreError::Forbidden(
                "internal notes are agent/backend only".to_string(),
            ));
        }

        let org_id = session.tenant.org_id;
        let record = self.load(org_id, conversation_id).await?;
        if record.status == ConversationStatus::Closed {
            return Err(CoreError::ConversationClosed(conversation_id));
        }

        // Atomic increment serializes ordering across concurrent senders
        let seq = self.cache.incr(&seq_key(org_id, conversation_id)).await?;

        let message = MessageRecord {
            id: Uuid::new_v4(),
            conversation_id,
            org_id,
            seq,
            sender: sender_for(&session.principal),
            message_kind,
            content: content.to_string(),
            is_internal,
            created_at: OffsetDateTime::now_utc(),
        };

        // The write must confirm before anyone sees the message
        self.conversations
            .append_message(&message)
            .await
            .map_err(|e| CoreError::DeliveryFailed(e.to_string()))?;

        let mut targets = self
            .registry
            .sessions_in_room(org_id, conversation_id)
            .await;
        if is_internal {
            targets.retain(|s| s.principal.sees_internal_notes());
        }

        Ok(RoutedMessage {
            record: message,
            targets,
        })
    }

    /// Mark messages read and resolve the fan-out targets. Returns the
    /// effective high-water sequence and the newly-read count.
    pub async fn mark_read(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
        up_to_seq: Option<i64>,
    ) -> CoreResult<(i64, i64, Sender)> {
        if !session.in_room(conversation_id).await {
            return Err(CoreError::NotInRoom(conversation_id));
        }
        let org_id = session.tenant.org_id;
        let reader = sender_for(&session.principal);

        let latest = match self.cache.get(&seq_key(org_id, conversation_id)).await? {
            Some(v) => v.parse::<i64>().unwrap_or(0),
            None => 0,
        };
        let target = up_to_seq.unwrap_or(latest).min(latest);

        let count = self
            .conversations
            .mark_read(org_id, conversation_id, &reader, Some(target))
            .await?;
        Ok((target, count, reader))
    }

    /// Close a conversation. Agents only; closing twice fails with
    /// `ConversationClosed`.
    pub async fn close(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
    ) -> CoreResult<ConversationRecord> {
        let Some(agent_id) = session.principal.agent_id() else {
            return Err(CoreError::Forbidden(
                "only agents may close conversations".to_string(),
            ));
        };

        let org_id = session.tenant.org_id;
        let record = self.load(org_id, conversation_id).await?;
        if record.status == ConversationStatus::Closed {
            return Err(CoreError::ConversationClosed(conversation_id));
        }

        self.conversations
            .update_status(org_id, conversation_id, ConversationStatus::Closed)
            .await?;
        if let Some(assigned) = record.assigned_agent_id {
            self.cache
                .srem(&assigned_key(org_id, assigned), &conversation_id.to_string())
                .await?;
        }

        tracing::info!(
            conversation_id = %conversation_id,
            org_id = %org_id,
            closed_by = %agent_id,
            "conversation closed"
        );
        Ok(record)
    }

    /// Close active conversations with no traffic past the inactivity
    /// window. Runs from the maintenance sweep; the close broadcast carries
    /// no closing agent. Returns the number closed.
    pub async fn close_idle(&self, max_idle: Duration) -> CoreResult<usize> {
        let cutoff = OffsetDateTime::now_utc() - max_idle;
        let stale = self.conversations.idle_active_conversations(cutoff).await?;

        let mut closed = 0;
        for record in stale {
            if !self
                .conversations
                .update_status(record.org_id, record.id, ConversationStatus::Closed)
                .await?
            {
                continue;
            }
            if let Some(assigned) = record.assigned_agent_id {
                self.cache
                    .srem(
                        &assigned_key(record.org_id, assigned),
                        &record.id.to_string(),
                    )
                    .await?;
            }
            self.registry
                .broadcast_room(
                    record.org_id,
                    record.id,
                    crate::dispatch::ServerEvent::ChatClosed {
                        conversation_id: record.id,
                        closed_by: None,
                    },
                )
                .await;
            tracing::info!(
                conversation_id = %record.id,
                org_id = %record.org_id,
                "conversation closed after inactivity"
            );
            closed += 1;
        }
        Ok(closed)
    }
}
