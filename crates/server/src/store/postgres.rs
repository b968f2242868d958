//! Postgres adapter for tenant configuration reads

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use livedesk_shared::{CoreResult, EnvKind};

use super::{AgentRecord, EnvironmentRecord, TenantStore};

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: Uuid,
    organization_id: Uuid,
    kind: EnvKind,
    plugin_key: String,
    api_key: String,
    api_secret_hash: String,
    allowed_origins: Vec<String>,
    is_active: bool,
    connection_rate_per_minute: Option<i32>,
    message_rate_per_minute: Option<i32>,
}

impl From<EnvironmentRow> for EnvironmentRecord {
    fn from(row: EnvironmentRow) -> Self {
        EnvironmentRecord {
            id: row.id,
            organization_id: row.organization_id,
            kind: row.kind,
            plugin_key: row.plugin_key,
            api_key: row.api_key,
            api_secret_hash: row.api_secret_hash,
            allowed_origins: row.allowed_origins,
            is_active: row.is_active,
            connection_rate_per_minute: row.connection_rate_per_minute.map(|v| v as u32),
            message_rate_per_minute: row.message_rate_per_minute.map(|v| v as u32),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    organization_id: Uuid,
    email: String,
    name: Option<String>,
    role: String,
    is_active: bool,
    concurrency_limit: Option<i32>,
}

impl From<AgentRow> for AgentRecord {
    fn from(row: AgentRow) -> Self {
        AgentRecord {
            id: row.id,
            organization_id: row.organization_id,
            email: row.email,
            name: row.name,
            role: row.role,
            is_active: row.is_active,
            concurrency_limit: row.concurrency_limit.map(|v| v as u32),
        }
    }
}

const ENVIRONMENT_COLUMNS: &str = r#"
    id, organization_id, kind, plugin_key, api_key, api_secret_hash,
    allowed_origins, is_active, connection_rate_per_minute, message_rate_per_minute
"#;

/// Tenant configuration reads against the relational store.
#[derive(Clone)]
pub struct PgTenantStore {
    pool: PgPool,
}

impl PgTenantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn environment_where(
        &self,
        clause: &str,
        bind: &str,
    ) -> CoreResult<Option<EnvironmentRecord>> {
        let query = format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE {clause} = $1"
        );
        let row = sqlx::query_as::<_, EnvironmentRow>(&query)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EnvironmentRecord::from))
    }
}

#[async_trait]
impl TenantStore for PgTenantStore {
    async fn environment_by_plugin_key(&self, key: &str) -> CoreResult<Option<EnvironmentRecord>> {
        self.environment_where("plugin_key", key).await
    }

    async fn environment_by_api_key(&self, key: &str) -> CoreResult<Option<EnvironmentRecord>> {
        self.environment_where("api_key", key).await
    }

    async fn environment_by_id(&self, env_id: Uuid) -> CoreResult<Option<EnvironmentRecord>> {
        let query = format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = $1");
        let row = sqlx::query_as::<_, EnvironmentRow>(&query)
            .bind(env_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EnvironmentRecord::from))
    }

    async fn default_environment(
        &self,
        org_id: Uuid,
        kind: EnvKind,
    ) -> CoreResult<Option<EnvironmentRecord>> {
        let query = format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments \
             WHERE organization_id = $1 AND kind = $2 \
             ORDER BY created_at ASC LIMIT 1"
        );
        let row = sqlx::query_as::<_, EnvironmentRow>(&query)
            .bind(org_id)
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EnvironmentRecord::from))
    }

    async fn agent_by_id(&self, agent_id: Uuid) -> CoreResult<Option<AgentRecord>> {
        let row = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id, organization_id, email, name, role, is_active, concurrency_limit
            FROM agents
            WHERE id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(AgentRecord::from))
    }

    async fn organization_active(&self, org_id: Uuid) -> CoreResult<bool> {
        let active = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE id = $1 AND is_active = TRUE)",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(active)
    }
}
