//! Wire event types and serialization
//!
//! Defines all client-to-server and server-to-client event types
//! with type-safe serde serialization.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use livedesk_shared::{AgentStatus, MessageKind};

use crate::store::{MessageRecord, Sender};

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a conversation room
    JoinChat { conversation_id: Uuid },

    /// Leave a conversation room
    LeaveChat { conversation_id: Uuid },

    /// Send a message into a joined conversation
    SendMessage {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        is_internal: bool,
        #[serde(default)]
        message_type: MessageKind,
    },

    /// Start typing in a conversation
    TypingStart { conversation_id: Uuid },

    /// Stop typing in a conversation
    TypingStop { conversation_id: Uuid },

    /// Mark messages read up to a sequence number (latest when omitted)
    MarkRead {
        conversation_id: Uuid,
        #[serde(default)]
        up_to_seq: Option<i64>,
    },

    /// Close a conversation (agents only)
    CloseChat { conversation_id: Uuid },

    /// Manually assign a conversation to an agent (agents only)
    AssignChat {
        conversation_id: Uuid,
        agent_id: Uuid,
    },

    /// Set agent availability (agents only)
    StatusChange { status: AgentStatus },

    /// Heartbeat ping to keep the connection alive
    Ping,
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected { session_id: Uuid },

    /// New message delivered to a conversation room
    NewMessage {
        conversation_id: Uuid,
        message: ChatMessageEvent,
    },

    /// Someone is (or stopped) typing in a conversation
    Typing {
        conversation_id: Uuid,
        sender: Sender,
        is_typing: bool,
    },

    /// A participant marked messages read
    MessageRead {
        conversation_id: Uuid,
        reader: Sender,
        up_to_seq: i64,
    },

    /// An agent was assigned (sent to the conversation room)
    AgentAssigned {
        conversation_id: Uuid,
        agent_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
    },

    /// Assignment notification for the receiving agent's dashboard
    ChatAssigned { conversation_id: Uuid, agent_id: Uuid },

    /// A conversation entered the waiting queue (sent to the org's agents)
    NewChat {
        conversation_id: Uuid,
        end_user_id: String,
        #[serde(with = "time::serde::rfc3339")]
        created_at: OffsetDateTime,
    },

    /// An agent's availability changed (sent to the org's agents)
    AgentStatusChanged {
        agent_id: Uuid,
        status: AgentStatus,
    },

    /// Conversation closed. `closed_by` is absent when the inactivity
    /// sweep closed it rather than an agent.
    ChatClosed {
        conversation_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        closed_by: Option<Uuid>,
    },

    /// Heartbeat response
    Pong,

    /// Error with a stable machine-readable code
    Error { code: String, message: String },
}

// =============================================================================
// Event Data Structures
// =============================================================================

/// Message payload as delivered on the wire
#[derive(Debug, Serialize, Clone)]
pub struct ChatMessageEvent {
    pub id: Uuid,
    pub seq: i64,
    pub sender: Sender,
    pub message_type: MessageKind,
    pub content: String,
    pub is_internal: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&MessageRecord> for ChatMessageEvent {
    fn from(record: &MessageRecord) -> Self {
        ChatMessageEvent {
            id: record.id,
            seq: record.seq,
            sender: record.sender.clone(),
            message_type: record.message_kind,
            content: record.content.clone(),
            is_internal: record.is_internal,
            created_at: record.created_at,
        }
    }
}

impl ServerEvent {
    /// Build the error event for a core failure.
    pub fn from_error(err: &livedesk_shared::CoreError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;

    #[test]
    fn test_client_event_deserialization() {
        let json =
            r#"{"type":"join_chat","conversation_id":"550e8400-e29b-41d4-a716-446655440000"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::JoinChat { conversation_id } => {
                assert_eq!(
                    conversation_id.to_string(),
                    "550e8400-e29b-41d4-a716-446655440000"
                );
            }
            _ => panic!("Expected JoinChat event"),
        }
    }

    #[test]
    fn test_send_message_defaults() {
        let json = r#"{"type":"send_message","conversation_id":"550e8400-e29b-41d4-a716-446655440000","content":"hi"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::SendMessage {
                is_internal,
                message_type,
                ..
            } => {
                assert!(!is_internal);
                assert_eq!(message_type, MessageKind::Text);
            }
            _ => panic!("Expected SendMessage event"),
        }
    }

    #[test]
    fn test_server_event_serialization() {
        let event = ServerEvent::Pong;
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_error_event_carries_code() {
        let event = ServerEvent::from_error(&livedesk_shared::CoreError::RateLimited);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("RATE_LIMITED"));
    }

    #[test]
    fn test_status_change_deserialization() {
        let json = r#"{"type":"status_change","status":"away"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(
            event,
            ClientEvent::StatusChange {
                status: AgentStatus::Away
            }
        ));
    }
}
