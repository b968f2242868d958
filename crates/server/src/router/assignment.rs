//! Agent auto-assignment
//!
//! Selection runs under a per-conversation cache lock so two waiting
//! conversations racing for the same idle agent never land on the same
//! slot twice. The loser of the lock simply walks away; the next sweep or
//! status change retries anything still waiting.

use std::time::Duration;

use uuid::Uuid;

use livedesk_shared::{ConversationStatus, CoreError, CoreResult};

use crate::dispatch::ServerEvent;
use crate::store::retry_read;

use super::conversation::{assigned_key, ConversationRouter};

const ASSIGN_LOCK_TTL: Duration = Duration::from_secs(10);

fn lock_key(conversation_id: Uuid) -> String {
    format!("assign:lock:{conversation_id}")
}

impl ConversationRouter {
    async fn assigned_count(&self, org_id: Uuid, agent_id: Uuid) -> CoreResult<usize> {
        Ok(self
            .cache
            .smembers(&assigned_key(org_id, agent_id))
            .await?
            .len())
    }

    /// Pick the eligible agent with the fewest assigned conversations,
    /// ties to the earliest online transition.
    async fn select_candidate(&self, org_id: Uuid) -> CoreResult<Option<Uuid>> {
        let mut best: Option<(Uuid, usize, i64)> = None;
        for (agent_id, presence) in self.registry.online_agents(org_id).await? {
            let count = self.assigned_count(org_id, agent_id).await?;
            if count >= presence.concurrency_limit as usize {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_count, best_since)) => {
                    count < best_count
                        || (count == best_count && presence.online_since < best_since)
                }
            };
            if better {
                best = Some((agent_id, count, presence.online_since));
            }
        }
        Ok(best.map(|(id, _, _)| id))
    }

    /// Try to auto-assign a waiting conversation. Returns the chosen agent,
    /// or None when the conversation is not waiting, the lock is held
    /// elsewhere, or no agent is eligible.
    pub async fn auto_assign(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
    ) -> CoreResult<Option<Uuid>> {
        let lock = lock_key(conversation_id);
        if !self.cache.set_nx(&lock, "1", ASSIGN_LOCK_TTL).await? {
            // Another selector holds the lock; lose gracefully
            return Ok(None);
        }

        let result = self.assign_under_lock(org_id, conversation_id).await;
        if let Err(e) = self.cache.delete(&lock).await {
            tracing::warn!(error = ?e, conversation_id = %conversation_id, "failed to release assignment lock");
        }
        result
    }

    async fn assign_under_lock(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
    ) -> CoreResult<Option<Uuid>> {
        let record = match self.load(org_id, conversation_id).await {
            Ok(r) => r,
            Err(CoreError::UnknownConversation(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if record.status != ConversationStatus::Waiting {
            return Ok(None);
        }

        let Some(agent_id) = self.select_candidate(org_id).await? else {
            tracing::debug!(
                conversation_id = %conversation_id,
                org_id = %org_id,
                "no eligible agent, conversation stays waiting"
            );
            return Ok(None);
        };

        self.commit_assignment(org_id, conversation_id, agent_id)
            .await?;
        Ok(Some(agent_id))
    }

    /// Manual assignment by an agent in the same organization. Bypasses the
    /// candidate policy but still respects org scoping.
    pub async fn manual_assign(
        &self,
        session: &std::sync::Arc<crate::presence::ConnectionSession>,
        conversation_id: Uuid,
        agent_id: Uuid,
    ) -> CoreResult<()> {
        if session.principal.agent_id().is_none() {
            return Err(CoreError::Forbidden(
                "only agents may assign conversations".to_string(),
            ));
        }
        let org_id = session.tenant.org_id;

        let target = retry_read(|| {
            let tenants = std::sync::Arc::clone(&self.tenants);
            async move { tenants.agent_by_id(agent_id).await }
        })
        .await?
        .filter(|a| a.is_active && a.organization_id == org_id)
        .ok_or_else(|| CoreError::Forbidden("no such agent in organization".to_string()))?;

        let record = self.load(org_id, conversation_id).await?;
        if record.status == ConversationStatus::Closed {
            return Err(CoreError::ConversationClosed(conversation_id));
        }
        if let Some(previous) = record.assigned_agent_id {
            self.cache
                .srem(&assigned_key(org_id, previous), &conversation_id.to_string())
                .await?;
        }

        self.commit_assignment(org_id, conversation_id, target.id)
            .await
    }

    async fn commit_assignment(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        agent_id: Uuid,
    ) -> CoreResult<()> {
        let updated = self
            .conversations
            .set_assigned_agent(org_id, conversation_id, Some(agent_id))
            .await?;
        if !updated {
            return Err(CoreError::UnknownConversation(conversation_id));
        }
        self.conversations
            .update_status(org_id, conversation_id, ConversationStatus::Active)
            .await?;
        self.cache
            .sadd(&assigned_key(org_id, agent_id), &conversation_id.to_string())
            .await?;

        let agent_name = match self.tenants.agent_by_id(agent_id).await {
            Ok(Some(a)) => a.name,
            _ => None,
        };
        self.registry
            .broadcast_room(
                org_id,
                conversation_id,
                ServerEvent::AgentAssigned {
                    conversation_id,
                    agent_id,
                    agent_name,
                },
            )
            .await;
        for session in self.registry.sessions_for_agent(org_id, agent_id).await {
            let _ = session.send(ServerEvent::ChatAssigned {
                conversation_id,
                agent_id,
            });
        }

        tracing::info!(
            conversation_id = %conversation_id,
            org_id = %org_id,
            agent_id = %agent_id,
            "conversation assigned"
        );
        Ok(())
    }

    /// Re-queue every conversation the departed agent held, then retry
    /// assignment for each.
    pub async fn reassign_on_disconnect(&self, org_id: Uuid, agent_id: Uuid) -> CoreResult<()> {
        let assigned = self.cache.smembers(&assigned_key(org_id, agent_id)).await?;
        for raw in assigned {
            let Ok(conversation_id) = raw.parse::<Uuid>() else {
                continue;
            };
            self.conversations
                .set_assigned_agent(org_id, conversation_id, None)
                .await?;
            self.conversations
                .update_status(org_id, conversation_id, ConversationStatus::Waiting)
                .await?;
            self.cache
                .srem(&assigned_key(org_id, agent_id), &raw)
                .await?;
            self.auto_assign(org_id, conversation_id).await?;
        }
        Ok(())
    }

    /// Retry assignment for every waiting conversation in an organization.
    /// Invoked on agent online transitions and by the periodic sweep.
    pub async fn sweep_waiting(&self, org_id: Uuid) -> CoreResult<usize> {
        let waiting = retry_read(|| {
            let store = std::sync::Arc::clone(&self.conversations);
            async move { store.waiting_conversations(org_id).await }
        })
        .await?;

        let mut assigned = 0;
        for conversation in waiting {
            if self.auto_assign(org_id, conversation.id).await?.is_some() {
                assigned += 1;
            }
        }
        Ok(assigned)
    }
}
