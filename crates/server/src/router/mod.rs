//! Conversation routing
//!
//! Room authorization, message sequencing and fan-out target resolution,
//! agent auto-assignment, and typing coalescing.

pub mod assignment;
pub mod conversation;
pub mod typing;

pub use conversation::{ConversationRouter, RoutedMessage, MAX_CONTENT_LEN};
pub use typing::{ExpiredTyping, TypingTracker};

use std::sync::Arc;

use uuid::Uuid;

use livedesk_shared::{CoreError, CoreResult};

use crate::dispatch::ServerEvent;
use crate::presence::ConnectionSession;

use conversation::sender_for;

impl ConversationRouter {
    /// Typing-start: coalesced, broadcast to the rest of the room only on
    /// an actual state change.
    pub async fn typing_start(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
    ) -> CoreResult<()> {
        if !session.in_room(conversation_id).await {
            return Err(CoreError::NotInRoom(conversation_id));
        }
        let org_id = session.tenant.org_id;
        let sender = sender_for(&session.principal);
        if self
            .typing
            .start(session.session_id, conversation_id, org_id, sender.clone())
            .await
        {
            self.broadcast_typing(org_id, conversation_id, session.session_id, sender, true)
                .await;
        }
        Ok(())
    }

    /// Explicit typing-stop. A stop without an active state is a no-op.
    pub async fn typing_stop(
        &self,
        session: &Arc<ConnectionSession>,
        conversation_id: Uuid,
    ) -> CoreResult<()> {
        if !session.in_room(conversation_id).await {
            return Err(CoreError::NotInRoom(conversation_id));
        }
        if self.typing.stop(session.session_id, conversation_id).await {
            let org_id = session.tenant.org_id;
            let sender = sender_for(&session.principal);
            self.broadcast_typing(org_id, conversation_id, session.session_id, sender, false)
                .await;
        }
        Ok(())
    }

    /// Auto-clear typing states idle past the window.
    pub async fn sweep_typing(&self) {
        for expired in self.typing.sweep_expired().await {
            self.registry
                .broadcast_room(
                    expired.org_id,
                    expired.conversation_id,
                    ServerEvent::Typing {
                        conversation_id: expired.conversation_id,
                        sender: expired.sender,
                        is_typing: false,
                    },
                )
                .await;
        }
    }

    /// Disconnect cleanup: clear any typing state the session held and
    /// broadcast the stops.
    pub async fn clear_typing_for_session(&self, session_id: Uuid) {
        for expired in self.typing.clear_session(session_id).await {
            self.registry
                .broadcast_room(
                    expired.org_id,
                    expired.conversation_id,
                    ServerEvent::Typing {
                        conversation_id: expired.conversation_id,
                        sender: expired.sender,
                        is_typing: false,
                    },
                )
                .await;
        }
    }

    async fn broadcast_typing(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        originator: Uuid,
        sender: crate::store::Sender,
        is_typing: bool,
    ) {
        for member in self
            .registry
            .sessions_in_room(org_id, conversation_id)
            .await
        {
            if member.session_id == originator {
                continue;
            }
            let _ = member.send(ServerEvent::Typing {
                conversation_id,
                sender: sender.clone(),
                is_typing,
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use std::time::Duration;

    use time::OffsetDateTime;
    use tokio::sync::mpsc;

    use livedesk_shared::{ConversationStatus, EnvKind, MemoryCache, MessageKind, SharedCache};

    use crate::auth::Principal;
    use crate::presence::SessionRegistry;
    use crate::store::{
        ConversationRecord, ConversationStore, MemoryConversationStore, MemoryTenantStore,
        AgentRecord,
    };
    use crate::tenant::{TenantContext, TenantLimits};

    struct Fixture {
        router: Arc<ConversationRouter>,
        registry: Arc<SessionRegistry>,
        conversations: Arc<MemoryConversationStore>,
        tenants: Arc<MemoryTenantStore>,
        cache: Arc<MemoryCache>,
        org_id: Uuid,
        env_id: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            let cache = Arc::new(MemoryCache::new());
            let conversations = Arc::new(MemoryConversationStore::new());
            let tenants = Arc::new(MemoryTenantStore::new());
            let registry = Arc::new(SessionRegistry::new(
                cache.clone() as Arc<dyn livedesk_shared::SharedCache>,
                5,
                Duration::from_secs(120),
            ));
            let router = Arc::new(ConversationRouter::new(
                conversations.clone(),
                tenants.clone(),
                registry.clone(),
                cache.clone(),
                TypingTracker::new(Duration::from_millis(50)),
            ));
            Self {
                router,
                registry,
                conversations,
                tenants,
                cache,
                org_id: Uuid::new_v4(),
                env_id: Uuid::new_v4(),
            }
        }

        fn tenant(&self) -> TenantContext {
            TenantContext {
                org_id: self.org_id,
                env_id: self.env_id,
                env_kind: EnvKind::Production,
                limits: TenantLimits {
                    connection_rate_per_minute: 30,
                    message_rate_per_minute: 120,
                },
                allowed_origins: vec![],
            }
        }

        async fn conversation(&self, end_user_id: &str) -> ConversationRecord {
            let record = ConversationRecord {
                id: Uuid::new_v4(),
                org_id: self.org_id,
                env_id: self.env_id,
                end_user_id: end_user_id.to_string(),
                status: ConversationStatus::Waiting,
                assigned_agent_id: None,
                created_at: OffsetDateTime::now_utc(),
            };
            self.conversations.create(record.clone()).await.unwrap();
            record
        }

        async fn user_session(
            &self,
            member_id: &str,
        ) -> (
            Arc<crate::presence::ConnectionSession>,
            mpsc::UnboundedReceiver<ServerEvent>,
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            let outcome = self
                .registry
                .register(
                    Principal::EndUser {
                        member_id: member_id.to_string(),
                        org_id: self.org_id,
                        env_id: self.env_id,
                    },
                    self.tenant(),
                    tx,
                    None,
                )
                .await
                .unwrap();
            (outcome.session, rx)
        }

        async fn agent_session(
            &self,
            agent_id: Uuid,
            limit: u32,
        ) -> (
            Arc<crate::presence::ConnectionSession>,
            mpsc::UnboundedReceiver<ServerEvent>,
        ) {
            self.tenants
                .add_agent(AgentRecord {
                    id: agent_id,
                    organization_id: self.org_id,
                    email: format!("{agent_id}@example.com"),
                    name: Some("Agent".to_string()),
                    role: "agent".to_string(),
                    is_active: true,
                    concurrency_limit: Some(limit),
                })
                .await;
            let (tx, rx) = mpsc::unbounded_channel();
            let outcome = self
                .registry
                .register(
                    Principal::Agent {
                        id: agent_id,
                        org_id: self.org_id,
                        email: format!("{agent_id}@example.com"),
                        name: Some("Agent".to_string()),
                        role: "agent".to_string(),
                    },
                    self.tenant(),
                    tx,
                    Some(limit),
                )
                .await
                .unwrap();
            (outcome.session, rx)
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_end_user_joins_own_conversation_only() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;

        let (own, _rx) = f.user_session("visitor-1").await;
        assert!(f.router.join(&own, conv.id).await.is_ok());

        let (other, _rx) = f.user_session("visitor-2").await;
        assert!(matches!(
            f.router.join(&other, conv.id).await,
            Err(CoreError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_join_closed_conversation_fails() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        f.conversations
            .update_status(f.org_id, conv.id, ConversationStatus::Closed)
            .await
            .unwrap();

        let (session, _rx) = f.user_session("visitor-1").await;
        assert!(matches!(
            f.router.join(&session, conv.id).await,
            Err(CoreError::ConversationClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_join_unknown_or_cross_org_conversation_fails() {
        let f = Fixture::new();
        let (session, _rx) = f.user_session("visitor-1").await;
        assert!(matches!(
            f.router.join(&session, Uuid::new_v4()).await,
            Err(CoreError::UnknownConversation(_))
        ));

        // A conversation in a foreign org is indistinguishable from a
        // missing one
        let foreign = ConversationRecord {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            env_id: Uuid::new_v4(),
            end_user_id: "visitor-1".to_string(),
            status: ConversationStatus::Waiting,
            assigned_agent_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        f.conversations.create(foreign.clone()).await.unwrap();
        assert!(matches!(
            f.router.join(&session, foreign.id).await,
            Err(CoreError::UnknownConversation(_))
        ));
    }

    #[tokio::test]
    async fn test_route_message_requires_membership() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (session, _rx) = f.user_session("visitor-1").await;

        let result = f
            .router
            .route_message(&session, conv.id, "hi", false, MessageKind::Text)
            .await;
        assert!(matches!(result, Err(CoreError::NotInRoom(_))));
    }

    #[tokio::test]
    async fn test_route_message_validates_content_and_capability() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (session, _rx) = f.user_session("visitor-1").await;
        f.router.join(&session, conv.id).await.unwrap();

        assert!(matches!(
            f.router
                .route_message(&session, conv.id, "", false, MessageKind::Text)
                .await,
            Err(CoreError::BadRequest(_))
        ));
        assert!(matches!(
            f.router
                .route_message(&session, conv.id, "note", true, MessageKind::Text)
                .await,
            Err(CoreError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_internal_notes_target_agents_only() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;

        let (user, _user_rx) = f.user_session("visitor-1").await;
        f.router.join(&user, conv.id).await.unwrap();
        let agent_id = Uuid::new_v4();
        let (agent, _agent_rx) = f.agent_session(agent_id, 5).await;
        f.router.join(&agent, conv.id).await.unwrap();

        let routed = f
            .router
            .route_message(&agent, conv.id, "internal note", true, MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(routed.targets.len(), 1);
        assert_eq!(routed.targets[0].session_id, agent.session_id);

        let routed = f
            .router
            .route_message(&agent, conv.id, "public reply", false, MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(routed.targets.len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_gap_free_under_concurrency() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (session, _rx) = f.user_session("visitor-1").await;
        f.router.join(&session, conv.id).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let router = Arc::clone(&f.router);
            let session = Arc::clone(&session);
            let conv_id = conv.id;
            handles.push(tokio::spawn(async move {
                router
                    .route_message(
                        &session,
                        conv_id,
                        &format!("message {i}"),
                        false,
                        MessageKind::Text,
                    )
                    .await
                    .map(|r| r.record.seq)
            }));
        }

        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_auto_assign_picks_fewest_assigned() {
        let f = Fixture::new();
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();
        let (_a, mut a_rx) = f.agent_session(agent_a, 5).await;
        let (_b, _b_rx) = f.agent_session(agent_b, 5).await;

        // B already holds three conversations
        for _ in 0..3 {
            f.cache
                .sadd(
                    &format!("assigned:{}:{agent_b}", f.org_id),
                    &Uuid::new_v4().to_string(),
                )
                .await
                .unwrap();
        }

        let conv = f.conversation("visitor-1").await;
        let chosen = f.router.auto_assign(f.org_id, conv.id).await.unwrap();
        assert_eq!(chosen, Some(agent_a));

        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.status, ConversationStatus::Active);
        assert_eq!(record.assigned_agent_id, Some(agent_a));

        // The winner's dashboard hears about it
        let events = drain(&mut a_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::ChatAssigned { agent_id, .. } if *agent_id == agent_a)));
    }

    #[tokio::test]
    async fn test_no_eligible_agent_leaves_waiting_then_sweep_assigns() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;

        assert_eq!(f.router.auto_assign(f.org_id, conv.id).await.unwrap(), None);
        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.status, ConversationStatus::Waiting);

        let agent_id = Uuid::new_v4();
        let (_agent, _rx) = f.agent_session(agent_id, 5).await;
        assert_eq!(f.router.sweep_waiting(f.org_id).await.unwrap(), 1);
        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.assigned_agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn test_agent_over_limit_is_not_eligible() {
        let f = Fixture::new();
        let agent_id = Uuid::new_v4();
        let (_agent, _rx) = f.agent_session(agent_id, 2).await;
        for _ in 0..2 {
            f.cache
                .sadd(
                    &format!("assigned:{}:{agent_id}", f.org_id),
                    &Uuid::new_v4().to_string(),
                )
                .await
                .unwrap();
        }

        let conv = f.conversation("visitor-1").await;
        assert_eq!(f.router.auto_assign(f.org_id, conv.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_assignment_lock_loses_gracefully() {
        let f = Fixture::new();
        let (_agent, _rx) = f.agent_session(Uuid::new_v4(), 5).await;
        let conv = f.conversation("visitor-1").await;

        // Someone else holds the selection lock
        f.cache
            .set_nx(&format!("assign:lock:{}", conv.id), "1", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(f.router.auto_assign(f.org_id, conv.id).await.unwrap(), None);
        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.status, ConversationStatus::Waiting);
    }

    #[tokio::test]
    async fn test_reassign_on_disconnect_moves_conversation() {
        let f = Fixture::new();
        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();
        let (a_session, _a_rx) = f.agent_session(agent_a, 5).await;
        let conv = f.conversation("visitor-1").await;
        assert_eq!(
            f.router.auto_assign(f.org_id, conv.id).await.unwrap(),
            Some(agent_a)
        );

        let (_b, _b_rx) = f.agent_session(agent_b, 5).await;
        let outcome = f.registry.deregister(a_session.session_id).await.unwrap();
        assert_eq!(outcome.agent_went_offline, Some(agent_a));
        f.router
            .reassign_on_disconnect(f.org_id, agent_a)
            .await
            .unwrap();

        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.assigned_agent_id, Some(agent_b));
        assert_eq!(record.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn test_manual_assign_requires_agent_in_same_org() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (user, _rx) = f.user_session("visitor-1").await;
        let agent_id = Uuid::new_v4();
        let (agent, _rx2) = f.agent_session(agent_id, 5).await;

        assert!(matches!(
            f.router.manual_assign(&user, conv.id, agent_id).await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            f.router.manual_assign(&agent, conv.id, Uuid::new_v4()).await,
            Err(CoreError::Forbidden(_))
        ));

        f.router.manual_assign(&agent, conv.id, agent_id).await.unwrap();
        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.assigned_agent_id, Some(agent_id));
    }

    #[tokio::test]
    async fn test_close_is_agent_only_and_terminal() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (user, _rx) = f.user_session("visitor-1").await;
        f.router.join(&user, conv.id).await.unwrap();
        let (agent, _rx2) = f.agent_session(Uuid::new_v4(), 5).await;

        assert!(matches!(
            f.router.close(&user, conv.id).await,
            Err(CoreError::Forbidden(_))
        ));

        f.router.close(&agent, conv.id).await.unwrap();
        assert!(matches!(
            f.router.close(&agent, conv.id).await,
            Err(CoreError::ConversationClosed(_))
        ));
        assert!(matches!(
            f.router
                .route_message(&user, conv.id, "hello?", false, MessageKind::Text)
                .await,
            Err(CoreError::ConversationClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_active_conversation_closes_on_timeout() {
        let f = Fixture::new();
        let agent_id = Uuid::new_v4();
        let (agent, mut agent_rx) = f.agent_session(agent_id, 5).await;
        let conv = f.conversation("visitor-1").await;
        assert_eq!(
            f.router.auto_assign(f.org_id, conv.id).await.unwrap(),
            Some(agent_id)
        );
        f.router.join(&agent, conv.id).await.unwrap();
        drain(&mut agent_rx);

        // Everything is older than a zero-length window
        assert_eq!(f.router.close_idle(Duration::ZERO).await.unwrap(), 1);

        let record = f.conversations.get(f.org_id, conv.id).await.unwrap().unwrap();
        assert_eq!(record.status, ConversationStatus::Closed);
        // The agent's slot is released
        assert!(f
            .cache
            .smembers(&format!("assigned:{}:{agent_id}", f.org_id))
            .await
            .unwrap()
            .is_empty());
        let events = drain(&mut agent_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::ChatClosed { conversation_id, closed_by: None } if *conversation_id == conv.id
        )));

        // A conversation with recent traffic survives a realistic window
        let conv2 = f.conversation("visitor-2").await;
        f.router.auto_assign(f.org_id, conv2.id).await.unwrap();
        let (user, _rx) = f.user_session("visitor-2").await;
        f.router.join(&user, conv2.id).await.unwrap();
        f.router
            .route_message(&user, conv2.id, "still here", false, MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(
            f.router.close_idle(Duration::from_secs(60)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_mark_read_counts_and_targets() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (user, _user_rx) = f.user_session("visitor-1").await;
        f.router.join(&user, conv.id).await.unwrap();
        let (agent, _agent_rx) = f.agent_session(Uuid::new_v4(), 5).await;
        f.router.join(&agent, conv.id).await.unwrap();

        for _ in 0..3 {
            f.router
                .route_message(&user, conv.id, "hello", false, MessageKind::Text)
                .await
                .unwrap();
        }

        let (up_to, count, _reader) = f.router.mark_read(&agent, conv.id, None).await.unwrap();
        assert_eq!(up_to, 3);
        assert_eq!(count, 3);

        let (_, count, _) = f.router.mark_read(&agent, conv.id, None).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_typing_coalesces_and_auto_clears() {
        let f = Fixture::new();
        let conv = f.conversation("visitor-1").await;
        let (user, _user_rx) = f.user_session("visitor-1").await;
        f.router.join(&user, conv.id).await.unwrap();
        let (agent, mut agent_rx) = f.agent_session(Uuid::new_v4(), 5).await;
        f.router.join(&agent, conv.id).await.unwrap();
        drain(&mut agent_rx);

        for _ in 0..1000 {
            f.router.typing_start(&user, conv.id).await.unwrap();
        }
        let typing_events = drain(&mut agent_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Typing { is_typing: true, .. }))
            .count();
        assert_eq!(typing_events, 1);

        // Idle window elapses, the sweep emits exactly one auto-clear
        tokio::time::sleep(Duration::from_millis(80)).await;
        f.router.sweep_typing().await;
        let clears = drain(&mut agent_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Typing { is_typing: false, .. }))
            .count();
        assert_eq!(clears, 1);
    }
}
