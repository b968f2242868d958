//! Session and presence registry
//!
//! Tracks every live session, conversation room membership, and agent
//! availability. Transport senders live in-process; presence and the
//! session index are mirrored into the shared cache so sibling services
//! can observe them. Mirror entries carry a TTL and are refreshed by the
//! maintenance sweep, so records left behind by a crashed instance expire
//! instead of reporting a dead agent as available.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use livedesk_shared::{AgentStatus, CoreError, CoreResult, SharedCache};

use super::session::ConnectionSession;
use crate::auth::Principal;
use crate::dispatch::ServerEvent;
use crate::tenant::TenantContext;

/// Durable agent availability record, kept in the shared cache per
/// (org, agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPresence {
    pub status: AgentStatus,
    /// Unix seconds of the last offline-to-online transition; the
    /// assignment tie-breaker.
    pub online_since: i64,
    pub concurrency_limit: u32,
}

/// Cache mirror of a live session, for scoped scans by sibling services.
#[derive(Debug, Serialize, Deserialize)]
struct SessionMirror {
    session_id: Uuid,
    org_id: Uuid,
    env_id: Uuid,
    principal_kind: String,
    connected_at: i64,
}

/// Result of registering a connection.
pub struct RegisterOutcome {
    pub session: Arc<ConnectionSession>,
    /// Set when this registration took an agent from offline to online.
    pub agent_came_online: bool,
}

/// Result of deregistering a connection. Deregistration is idempotent;
/// `existed` is false on repeat calls.
pub struct DeregisterOutcome {
    pub existed: bool,
    /// Organization of the departed session; None when nothing was removed.
    pub org_id: Option<Uuid>,
    pub left_rooms: Vec<Uuid>,
    /// Set when the departing session was an agent's last one.
    pub agent_went_offline: Option<Uuid>,
}

fn presence_key(org_id: Uuid, agent_id: Uuid) -> String {
    format!("presence:{org_id}:{agent_id}")
}

fn online_index_key(org_id: Uuid) -> String {
    format!("agents:online:{org_id}")
}

fn session_key(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

fn session_index_key(org_id: Uuid) -> String {
    format!("sessions:{org_id}")
}

/// Registry of live sessions and conversation rooms.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<ConnectionSession>>>,
    /// Map of conversation_id -> sessions in the room
    rooms: RwLock<HashMap<Uuid, Vec<Arc<ConnectionSession>>>>,
    cache: Arc<dyn SharedCache>,
    default_concurrency: u32,
    /// Lifetime of cache mirrors between refreshes. Must exceed the sweep
    /// interval or live records lapse between ticks.
    presence_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(
        cache: Arc<dyn SharedCache>,
        default_concurrency: u32,
        presence_ttl: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            cache,
            default_concurrency,
            presence_ttl,
        }
    }

    /// Register a new connection. For agents, the first live session takes
    /// the agent online; additional sessions share the presence record.
    pub async fn register(
        &self,
        principal: Principal,
        tenant: TenantContext,
        sender: mpsc::UnboundedSender<ServerEvent>,
        concurrency_limit: Option<u32>,
    ) -> CoreResult<RegisterOutcome> {
        let session = Arc::new(ConnectionSession::new(principal, tenant, sender));
        let org_id = session.tenant.org_id;

        let mut agent_came_online = false;
        if let Some(agent_id) = session.principal.agent_id() {
            agent_came_online = self
                .claim_online(
                    org_id,
                    agent_id,
                    AgentPresence {
                        status: AgentStatus::Online,
                        online_since: OffsetDateTime::now_utc().unix_timestamp(),
                        concurrency_limit: concurrency_limit
                            .unwrap_or(self.default_concurrency),
                    },
                )
                .await?;
        }

        self.cache
            .sadd(
                &session_index_key(org_id),
                &session.session_id.to_string(),
            )
            .await?;
        if let Ok(json) = serde_json::to_string(&SessionMirror {
            session_id: session.session_id,
            org_id,
            env_id: session.tenant.env_id,
            principal_kind: session.principal.kind().to_string(),
            connected_at: session.connected_at.unix_timestamp(),
        }) {
            self.cache
                .set(
                    &session_key(session.session_id),
                    &json,
                    Some(self.presence_ttl),
                )
                .await?;
        }

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, Arc::clone(&session));
        tracing::debug!(
            session_id = %session.session_id,
            org_id = %org_id,
            principal = %session.principal.kind(),
            total_sessions = sessions.len(),
            "session registered"
        );

        Ok(RegisterOutcome {
            session,
            agent_came_online,
        })
    }

    /// Deregister a connection, removing every room membership. Safe to
    /// call more than once.
    pub async fn deregister(&self, session_id: Uuid) -> CoreResult<DeregisterOutcome> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id)
        };
        let Some(session) = session else {
            return Ok(DeregisterOutcome {
                existed: false,
                org_id: None,
                left_rooms: Vec::new(),
                agent_went_offline: None,
            });
        };

        let mut left_rooms = Vec::new();
        {
            let mut rooms = self.rooms.write().await;
            for (conversation_id, members) in rooms.iter_mut() {
                let before = members.len();
                members.retain(|s| s.session_id != session_id);
                if members.len() < before {
                    left_rooms.push(*conversation_id);
                }
            }
            rooms.retain(|_, members| !members.is_empty());
        }

        let org_id = session.tenant.org_id;
        self.cache
            .srem(&session_index_key(org_id), &session_id.to_string())
            .await?;
        self.cache.delete(&session_key(session_id)).await?;

        let mut agent_went_offline = None;
        if let Some(agent_id) = session.principal.agent_id() {
            if !self.agent_has_sessions(org_id, agent_id).await {
                self.clear_presence(org_id, agent_id).await?;
                agent_went_offline = Some(agent_id);
            }
        }

        tracing::debug!(
            session_id = %session_id,
            rooms_left = left_rooms.len(),
            agent_went_offline = agent_went_offline.is_some(),
            "session deregistered"
        );

        Ok(DeregisterOutcome {
            existed: true,
            org_id: Some(org_id),
            left_rooms,
            agent_went_offline,
        })
    }

    pub async fn session(&self, session_id: Uuid) -> Option<Arc<ConnectionSession>> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).cloned()
    }

    /// Add a session to a conversation room. Authorization happens in the
    /// router before this is called.
    pub async fn join_room(&self, session_id: Uuid, conversation_id: Uuid) -> CoreResult<()> {
        let session = self
            .session(session_id)
            .await
            .ok_or_else(|| CoreError::State("unknown session".to_string()))?;

        session.join_room(conversation_id).await;
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(conversation_id).or_default();
        if !members.iter().any(|s| s.session_id == session_id) {
            members.push(session);
        }
        Ok(())
    }

    pub async fn leave_room(&self, session_id: Uuid, conversation_id: Uuid) -> CoreResult<()> {
        if let Some(session) = self.session(session_id).await {
            session.leave_room(conversation_id).await;
        }
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.retain(|s| s.session_id != session_id);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
        Ok(())
    }

    /// Sessions in a conversation room, restricted to the caller's
    /// organization. Cross-tenant sessions are never returned even if a bug
    /// elsewhere let one into the room.
    pub async fn sessions_in_room(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
    ) -> Vec<Arc<ConnectionSession>> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&conversation_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|s| s.tenant.org_id == org_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All live agent sessions in an organization (dashboard fan-out).
    pub async fn agent_sessions(&self, org_id: Uuid) -> Vec<Arc<ConnectionSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.tenant.org_id == org_id && s.principal.agent_id().is_some())
            .cloned()
            .collect()
    }

    /// Live sessions belonging to one agent.
    pub async fn sessions_for_agent(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Vec<Arc<ConnectionSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.tenant.org_id == org_id && s.principal.agent_id() == Some(agent_id))
            .cloned()
            .collect()
    }

    /// Organizations with at least one live agent session; the waiting
    /// sweep only needs to look at these.
    pub async fn agent_orgs(&self) -> Vec<Uuid> {
        let sessions = self.sessions.read().await;
        let mut orgs: Vec<Uuid> = sessions
            .values()
            .filter(|s| s.principal.agent_id().is_some())
            .map(|s| s.tenant.org_id)
            .collect();
        orgs.sort_unstable();
        orgs.dedup();
        orgs
    }

    async fn agent_has_sessions(&self, org_id: Uuid, agent_id: Uuid) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .any(|s| s.tenant.org_id == org_id && s.principal.agent_id() == Some(agent_id))
    }

    /// Explicit availability change. Moving to `Offline` clears the
    /// presence record; moving from offline to online resets the
    /// online-since marker.
    pub async fn set_agent_status(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        status: AgentStatus,
    ) -> CoreResult<()> {
        if status == AgentStatus::Offline {
            return self.clear_presence(org_id, agent_id).await;
        }

        let presence = match self.agent_status(org_id, agent_id).await? {
            Some(mut p) => {
                if p.status == AgentStatus::Offline && status == AgentStatus::Online {
                    p.online_since = OffsetDateTime::now_utc().unix_timestamp();
                }
                p.status = status;
                p
            }
            None => AgentPresence {
                status,
                online_since: OffsetDateTime::now_utc().unix_timestamp(),
                concurrency_limit: self.default_concurrency,
            },
        };
        self.write_presence(org_id, agent_id, presence).await
    }

    pub async fn agent_status(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> CoreResult<Option<AgentPresence>> {
        match self.cache.get(&presence_key(org_id, agent_id)).await? {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// Agents currently indexed as online in an organization, with their
    /// presence records. Index entries whose record has expired belong to a
    /// crashed instance and are pruned here.
    pub async fn online_agents(&self, org_id: Uuid) -> CoreResult<Vec<(Uuid, AgentPresence)>> {
        let ids = self.cache.smembers(&online_index_key(org_id)).await?;
        let mut agents = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(agent_id) = id.parse::<Uuid>() else {
                continue;
            };
            match self.agent_status(org_id, agent_id).await? {
                Some(presence) => {
                    if presence.status == AgentStatus::Online {
                        agents.push((agent_id, presence));
                    }
                }
                None => self.cache.srem(&online_index_key(org_id), &id).await?,
            }
        }
        Ok(agents)
    }

    /// Claim the offline-to-online transition for an agent. `set_nx` makes
    /// two racing first sessions agree on a single transition; the loser
    /// keeps the existing record and only extends its lifetime.
    async fn claim_online(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        presence: AgentPresence,
    ) -> CoreResult<bool> {
        let json = serde_json::to_string(&presence)
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        let key = presence_key(org_id, agent_id);
        let claimed = self.cache.set_nx(&key, &json, self.presence_ttl).await?;
        if !claimed {
            self.cache.expire(&key, self.presence_ttl).await?;
        }
        self.cache
            .sadd(&online_index_key(org_id), &agent_id.to_string())
            .await?;
        Ok(claimed)
    }

    async fn write_presence(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        presence: AgentPresence,
    ) -> CoreResult<()> {
        let json = serde_json::to_string(&presence)
            .map_err(|e| CoreError::DependencyUnavailable(e.to_string()))?;
        self.cache
            .set(
                &presence_key(org_id, agent_id),
                &json,
                Some(self.presence_ttl),
            )
            .await?;
        self.cache
            .sadd(&online_index_key(org_id), &agent_id.to_string())
            .await?;
        Ok(())
    }

    /// Extend the cache lifetime of every live session's mirrors and prune
    /// session-index entries whose mirror has expired. Runs from the
    /// maintenance sweep, so a crashed instance's records outlive it by at
    /// most one TTL.
    pub async fn refresh_mirrors(&self) -> CoreResult<()> {
        let sessions: Vec<Arc<ConnectionSession>> = {
            let map = self.sessions.read().await;
            map.values().cloned().collect()
        };

        let mut orgs = Vec::new();
        for session in &sessions {
            self.cache
                .expire(&session_key(session.session_id), self.presence_ttl)
                .await?;
            if let Some(agent_id) = session.principal.agent_id() {
                self.cache
                    .expire(
                        &presence_key(session.tenant.org_id, agent_id),
                        self.presence_ttl,
                    )
                    .await?;
            }
            orgs.push(session.tenant.org_id);
        }
        orgs.sort_unstable();
        orgs.dedup();

        for org_id in orgs {
            for raw in self.cache.smembers(&session_index_key(org_id)).await? {
                if !self.cache.exists(&format!("session:{raw}")).await? {
                    self.cache.srem(&session_index_key(org_id), &raw).await?;
                }
            }
        }
        Ok(())
    }

    async fn clear_presence(&self, org_id: Uuid, agent_id: Uuid) -> CoreResult<()> {
        self.cache.delete(&presence_key(org_id, agent_id)).await?;
        self.cache
            .srem(&online_index_key(org_id), &agent_id.to_string())
            .await?;
        Ok(())
    }

    /// Broadcast to every member of a conversation room within the
    /// organization. Send errors are ignored; dead connections are reaped
    /// by their own receive loops.
    pub async fn broadcast_room(&self, org_id: Uuid, conversation_id: Uuid, event: ServerEvent) {
        for session in self.sessions_in_room(org_id, conversation_id).await {
            if session.send(event.clone()).is_err() {
                tracing::warn!(
                    session_id = %session.session_id,
                    "failed to send event to room member (likely closed)"
                );
            }
        }
    }

    /// Broadcast to every live agent session in an organization.
    pub async fn broadcast_org_agents(&self, org_id: Uuid, event: ServerEvent) {
        for session in self.agent_sessions(org_id).await {
            let _ = session.send(event.clone());
        }
    }

    /// Session ids idle past the threshold; the caller deregisters them.
    pub async fn idle_sessions(&self, max_idle: Duration) -> Vec<Uuid> {
        let sessions = {
            let map = self.sessions.read().await;
            map.values().cloned().collect::<Vec<_>>()
        };
        let mut stale = Vec::new();
        for session in sessions {
            if session.idle_for().await > max_idle {
                stale.push(session.session_id);
            }
        }
        stale
    }

    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }
}
