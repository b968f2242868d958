//! In-memory store implementations for development and tests

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use livedesk_shared::{ConversationStatus, CoreResult, EnvKind};

use super::{
    AgentRecord, ConversationRecord, ConversationStore, EnvironmentRecord, MessageRecord, Sender,
    TenantStore,
};

/// In-memory tenant store seeded by hand.
#[derive(Default)]
pub struct MemoryTenantStore {
    environments: RwLock<Vec<EnvironmentRecord>>,
    agents: RwLock<Vec<AgentRecord>>,
    inactive_orgs: RwLock<Vec<Uuid>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_environment(&self, env: EnvironmentRecord) {
        self.environments.write().await.push(env);
    }

    pub async fn add_agent(&self, agent: AgentRecord) {
        self.agents.write().await.push(agent);
    }

    pub async fn deactivate_org(&self, org_id: Uuid) {
        self.inactive_orgs.write().await.push(org_id);
    }
}

#[async_trait]
impl TenantStore for MemoryTenantStore {
    async fn environment_by_plugin_key(&self, key: &str) -> CoreResult<Option<EnvironmentRecord>> {
        let envs = self.environments.read().await;
        Ok(envs.iter().find(|e| e.plugin_key == key).cloned())
    }

    async fn environment_by_api_key(&self, key: &str) -> CoreResult<Option<EnvironmentRecord>> {
        let envs = self.environments.read().await;
        Ok(envs.iter().find(|e| e.api_key == key).cloned())
    }

    async fn environment_by_id(&self, env_id: Uuid) -> CoreResult<Option<EnvironmentRecord>> {
        let envs = self.environments.read().await;
        Ok(envs.iter().find(|e| e.id == env_id).cloned())
    }

    async fn default_environment(
        &self,
        org_id: Uuid,
        kind: EnvKind,
    ) -> CoreResult<Option<EnvironmentRecord>> {
        let envs = self.environments.read().await;
        Ok(envs
            .iter()
            .find(|e| e.organization_id == org_id && e.kind == kind)
            .cloned())
    }

    async fn agent_by_id(&self, agent_id: Uuid) -> CoreResult<Option<AgentRecord>> {
        let agents = self.agents.read().await;
        Ok(agents.iter().find(|a| a.id == agent_id).cloned())
    }

    async fn organization_active(&self, org_id: Uuid) -> CoreResult<bool> {
        let inactive = self.inactive_orgs.read().await;
        Ok(!inactive.contains(&org_id))
    }
}

/// In-memory conversation/message store.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<Uuid, ConversationRecord>>,
    messages: RwLock<HashMap<Uuid, Vec<MessageRecord>>>,
    read_marks: RwLock<HashMap<(Uuid, String), i64>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages appended for a conversation, in append order.
    pub async fn messages(&self, conversation_id: Uuid) -> Vec<MessageRecord> {
        let messages = self.messages.read().await;
        messages.get(&conversation_id).cloned().unwrap_or_default()
    }
}

fn reader_key(reader: &Sender) -> String {
    match reader {
        Sender::User { id } => format!("user:{id}"),
        Sender::Agent { id } => format!("agent:{id}"),
        Sender::Backend => "backend".to_string(),
        Sender::System => "system".to_string(),
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
    ) -> CoreResult<Option<ConversationRecord>> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(&conversation_id)
            .filter(|c| c.org_id == org_id)
            .cloned())
    }

    async fn create(&self, record: ConversationRecord) -> CoreResult<()> {
        let mut conversations = self.conversations.write().await;
        conversations.insert(record.id, record);
        Ok(())
    }

    async fn update_status(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        status: ConversationStatus,
    ) -> CoreResult<bool> {
        let mut conversations = self.conversations.write().await;
        match conversations
            .get_mut(&conversation_id)
            .filter(|c| c.org_id == org_id)
        {
            Some(conv) => {
                conv.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_assigned_agent(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> CoreResult<bool> {
        let mut conversations = self.conversations.write().await;
        match conversations
            .get_mut(&conversation_id)
            .filter(|c| c.org_id == org_id)
        {
            Some(conv) => {
                conv.assigned_agent_id = agent_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn append_message(&self, message: &MessageRecord) -> CoreResult<()> {
        let mut messages = self.messages.write().await;
        messages
            .entry(message.conversation_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn waiting_conversations(&self, org_id: Uuid) -> CoreResult<Vec<ConversationRecord>> {
        let conversations = self.conversations.read().await;
        let mut waiting: Vec<ConversationRecord> = conversations
            .values()
            .filter(|c| c.org_id == org_id && c.status == ConversationStatus::Waiting)
            .cloned()
            .collect();
        waiting.sort_by_key(|c| c.created_at);
        Ok(waiting)
    }

    async fn idle_active_conversations(
        &self,
        cutoff: OffsetDateTime,
    ) -> CoreResult<Vec<ConversationRecord>> {
        let conversations = self.conversations.read().await;
        let messages = self.messages.read().await;
        Ok(conversations
            .values()
            .filter(|c| c.status == ConversationStatus::Active)
            .filter(|c| {
                let last_activity = messages
                    .get(&c.id)
                    .and_then(|m| m.last())
                    .map(|m| m.created_at)
                    .unwrap_or(c.created_at);
                last_activity < cutoff
            })
            .cloned()
            .collect())
    }

    async fn mark_read(
        &self,
        org_id: Uuid,
        conversation_id: Uuid,
        reader: &Sender,
        up_to_seq: Option<i64>,
    ) -> CoreResult<i64> {
        let messages = self.messages.read().await;
        let Some(msgs) = messages.get(&conversation_id) else {
            return Ok(0);
        };
        if msgs.first().is_some_and(|m| m.org_id != org_id) {
            return Ok(0);
        }

        let latest = msgs.iter().map(|m| m.seq).max().unwrap_or(0);
        let target = up_to_seq.unwrap_or(latest).min(latest);

        let mut marks = self.read_marks.write().await;
        let key = (conversation_id, reader_key(reader));
        let previous = marks.get(&key).copied().unwrap_or(0);
        if target <= previous {
            return Ok(0);
        }
        marks.insert(key, target);
        Ok(target - previous)
    }
}
