//! Live connection sessions
//!
//! Represents one authenticated WebSocket connection with room membership
//! tracking. The transport sender stays in-process; durable presence state
//! lives in the shared cache (see the registry).

use std::collections::HashSet;
use std::time::Instant;

use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::auth::Principal;
use crate::dispatch::ServerEvent;
use crate::tenant::TenantContext;

/// One live, authenticated connection.
#[derive(Debug)]
pub struct ConnectionSession {
    /// Unique session ID for this connection
    pub session_id: Uuid,

    /// Verified identity behind the connection
    pub principal: Principal,

    /// Resolved tenant scope
    pub tenant: TenantContext,

    /// Channel to send events to this connection
    pub sender: mpsc::UnboundedSender<ServerEvent>,

    pub connected_at: OffsetDateTime,

    /// Refreshed on every inbound event; drives the idle sweep.
    last_activity: RwLock<Instant>,

    /// Conversation rooms this session has joined
    rooms: RwLock<HashSet<Uuid>>,
}

impl ConnectionSession {
    pub fn new(
        principal: Principal,
        tenant: TenantContext,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            principal,
            tenant,
            sender,
            connected_at: OffsetDateTime::now_utc(),
            last_activity: RwLock::new(Instant::now()),
            rooms: RwLock::new(HashSet::new()),
        }
    }

    /// Send an event to this connection.
    ///
    /// Returns Err if the connection is closed; callers treat that as a
    /// slow/dead peer and move on.
    #[allow(clippy::result_large_err)]
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    pub async fn join_room(&self, conversation_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        rooms.insert(conversation_id);
    }

    /// Returns true when the session was actually in the room.
    pub async fn leave_room(&self, conversation_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms.remove(&conversation_id)
    }

    pub async fn in_room(&self, conversation_id: Uuid) -> bool {
        let rooms = self.rooms.read().await;
        rooms.contains(&conversation_id)
    }

    pub async fn rooms(&self) -> HashSet<Uuid> {
        let rooms = self.rooms.read().await;
        rooms.clone()
    }

    /// Record inbound activity (any event, including ping).
    pub async fn touch(&self) {
        let mut last = self.last_activity.write().await;
        *last = Instant::now();
    }

    pub async fn idle_for(&self) -> std::time::Duration {
        let last = self.last_activity.read().await;
        last.elapsed()
    }
}
