//! Tenant context resolution
//!
//! Maps a verified principal to its organization/environment scope plus
//! effective configuration. Cache-first with a short TTL; entries are never
//! mutated in place, only refreshed by replacement.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use livedesk_shared::{CoreError, CoreResult, EnvKind, SharedCache};

use crate::auth::Principal;
use crate::store::{retry_read, EnvironmentRecord, TenantStore};

/// Effective per-tenant limits after applying server defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantLimits {
    pub connection_rate_per_minute: u32,
    pub message_rate_per_minute: u32,
}

/// The organization/environment scope all operations are checked against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub org_id: Uuid,
    pub env_id: Uuid,
    pub env_kind: EnvKind,
    pub limits: TenantLimits,
    pub allowed_origins: Vec<String>,
}

impl TenantContext {
    /// Two sessions share a scope iff organization and environment match.
    pub fn same_scope(&self, other: &TenantContext) -> bool {
        self.org_id == other.org_id && self.env_id == other.env_id
    }
}

/// Server-wide fallbacks applied when an environment has no override.
#[derive(Debug, Clone, Copy)]
pub struct LimitDefaults {
    pub connection_rate_per_minute: u32,
    pub message_rate_per_minute: u32,
}

/// Resolves principals to tenant contexts, cache-first.
pub struct TenantResolver {
    tenants: Arc<dyn TenantStore>,
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
    defaults: LimitDefaults,
}

impl TenantResolver {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        cache: Arc<dyn SharedCache>,
        ttl: Duration,
        defaults: LimitDefaults,
    ) -> Self {
        Self {
            tenants,
            cache,
            ttl,
            defaults,
        }
    }

    /// Resolve the tenant context for a principal. End-users and backend
    /// services carry their environment; agents operate in their
    /// organization's production environment.
    pub async fn resolve(&self, principal: &Principal) -> CoreResult<TenantContext> {
        match principal {
            Principal::EndUser { env_id, .. } | Principal::BackendService { env_id, .. } => {
                self.resolve_environment(*env_id).await
            }
            Principal::Agent { org_id, .. } => self.resolve_org_default(*org_id).await,
        }
    }

    async fn resolve_environment(&self, env_id: Uuid) -> CoreResult<TenantContext> {
        let cache_key = format!("tenant:env:{env_id}");
        if let Some(ctx) = self.cached(&cache_key).await {
            return Ok(ctx);
        }

        let env = retry_read(|| {
            let tenants = Arc::clone(&self.tenants);
            async move { tenants.environment_by_id(env_id).await }
        })
        .await?
        .filter(|e| e.is_active)
        .ok_or(CoreError::UnknownTenant)?;

        let ctx = self.context_from(&env);
        self.store_cached(&cache_key, &ctx).await;
        Ok(ctx)
    }

    async fn resolve_org_default(&self, org_id: Uuid) -> CoreResult<TenantContext> {
        let cache_key = format!("tenant:org:{org_id}");
        if let Some(ctx) = self.cached(&cache_key).await {
            return Ok(ctx);
        }

        let env = retry_read(|| {
            let tenants = Arc::clone(&self.tenants);
            async move { tenants.default_environment(org_id, EnvKind::Production).await }
        })
        .await?
        .filter(|e| e.is_active)
        .ok_or(CoreError::UnknownTenant)?;

        let ctx = self.context_from(&env);
        self.store_cached(&cache_key, &ctx).await;
        Ok(ctx)
    }

    fn context_from(&self, env: &EnvironmentRecord) -> TenantContext {
        TenantContext {
            org_id: env.organization_id,
            env_id: env.id,
            env_kind: env.kind,
            limits: TenantLimits {
                connection_rate_per_minute: env
                    .connection_rate_per_minute
                    .unwrap_or(self.defaults.connection_rate_per_minute),
                message_rate_per_minute: env
                    .message_rate_per_minute
                    .unwrap_or(self.defaults.message_rate_per_minute),
            },
            allowed_origins: env.allowed_origins.clone(),
        }
    }

    async fn cached(&self, key: &str) -> Option<TenantContext> {
        match self.cache.get(key).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            // A cache miss or cache outage both fall through to the store
            _ => None,
        }
    }

    async fn store_cached(&self, key: &str, ctx: &TenantContext) {
        if let Ok(json) = serde_json::to_string(ctx) {
            if let Err(e) = self.cache.set(key, &json, Some(self.ttl)).await {
                tracing::warn!(error = ?e, key = %key, "failed to cache tenant context");
            }
        }
    }
}
