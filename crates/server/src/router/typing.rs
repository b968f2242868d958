//! Typing indicator coalescing
//!
//! Typing state is best-effort: never sequenced, never persisted. Repeated
//! typing-start events within the inactivity window collapse into one
//! effective state change; a trailing sweep auto-clears entries whose
//! session went quiet without an explicit stop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::Sender;

struct TypingEntry {
    org_id: Uuid,
    sender: Sender,
    last_refresh: Instant,
}

/// An auto-cleared typing state, to be broadcast as a stop.
pub struct ExpiredTyping {
    pub org_id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Sender,
}

/// Coalesces typing events per (session, conversation).
pub struct TypingTracker {
    entries: Mutex<HashMap<(Uuid, Uuid), TypingEntry>>,
    idle_window: Duration,
}

impl TypingTracker {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_window,
        }
    }

    /// Record a typing-start. Returns true when the state actually changed
    /// and a broadcast is warranted; repeats within the window refresh the
    /// timer silently.
    pub async fn start(
        &self,
        session_id: Uuid,
        conversation_id: Uuid,
        org_id: Uuid,
        sender: Sender,
    ) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.entry((session_id, conversation_id)) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().last_refresh = Instant::now();
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(TypingEntry {
                    org_id,
                    sender,
                    last_refresh: Instant::now(),
                });
                true
            }
        }
    }

    /// Record an explicit typing-stop. Returns true when a typing state was
    /// actually active.
    pub async fn stop(&self, session_id: Uuid, conversation_id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        entries.remove(&(session_id, conversation_id)).is_some()
    }

    /// Drop every state a session held (disconnect cleanup), returning the
    /// conversations that need a stop broadcast.
    pub async fn clear_session(&self, session_id: Uuid) -> Vec<ExpiredTyping> {
        let mut entries = self.entries.lock().await;
        let keys: Vec<(Uuid, Uuid)> = entries
            .keys()
            .filter(|(sid, _)| *sid == session_id)
            .copied()
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                entries.remove(&key).map(|entry| ExpiredTyping {
                    org_id: entry.org_id,
                    conversation_id: key.1,
                    sender: entry.sender,
                })
            })
            .collect()
    }

    /// Remove entries idle past the window, returning the auto-clears to
    /// broadcast.
    pub async fn sweep_expired(&self) -> Vec<ExpiredTyping> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<(Uuid, Uuid)> = entries
            .iter()
            .filter(|(_, e)| e.last_refresh.elapsed() > self.idle_window)
            .map(|(k, _)| *k)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                entries.remove(&key).map(|entry| ExpiredTyping {
                    org_id: entry.org_id,
                    conversation_id: key.1,
                    sender: entry.sender,
                })
            })
            .collect()
    }
}
