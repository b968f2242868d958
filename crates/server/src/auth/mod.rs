//! Credential verification
//!
//! Three credential shapes arrive over one transport: plugin keys from
//! embedded widgets, API key + secret pairs from customer backends, and
//! bearer tokens from the agent dashboard. Verification resolves each into
//! an immutable [`Principal`] exactly once at connection time; nothing
//! downstream re-checks credential material.

pub mod jwt;
pub mod keys;

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use livedesk_shared::{CoreError, CoreResult, SharedCache};

use crate::store::{retry_read, EnvironmentRecord, TenantStore};

pub use jwt::{AgentClaims, JwtManager, TokenType};
pub use keys::KeyManager;

/// Raw credential material attached at connection time.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Widget embed: plugin key plus the widget-side member/session id.
    PluginKey { key: String, member_id: String },
    /// Customer backend: API key and matching secret.
    ApiKey { key: String, secret: String },
    /// Agent dashboard: JWT bearer token.
    Bearer { token: String },
}

/// The authenticated identity behind a connection. Immutable for the
/// connection's lifetime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    EndUser {
        /// Widget-side identifier (opaque to the core).
        member_id: String,
        org_id: Uuid,
        env_id: Uuid,
    },
    BackendService {
        org_id: Uuid,
        env_id: Uuid,
    },
    Agent {
        id: Uuid,
        org_id: Uuid,
        email: String,
        name: Option<String>,
        role: String,
    },
}

impl Principal {
    pub fn org_id(&self) -> Uuid {
        match self {
            Principal::EndUser { org_id, .. }
            | Principal::BackendService { org_id, .. }
            | Principal::Agent { org_id, .. } => *org_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Principal::EndUser { .. } => "end_user",
            Principal::BackendService { .. } => "backend",
            Principal::Agent { .. } => "agent",
        }
    }

    /// Stable identity string for rate limiting and logging.
    pub fn rate_key(&self) -> String {
        match self {
            Principal::EndUser { member_id, org_id, .. } => format!("user:{org_id}:{member_id}"),
            Principal::BackendService { env_id, .. } => format!("backend:{env_id}"),
            Principal::Agent { id, .. } => format!("agent:{id}"),
        }
    }

    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Principal::Agent { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Internal notes are agent/backend only; end-users never author or
    /// receive them.
    pub fn can_author_internal_notes(&self) -> bool {
        !matches!(self, Principal::EndUser { .. })
    }

    pub fn sees_internal_notes(&self) -> bool {
        !matches!(self, Principal::EndUser { .. })
    }
}

/// Validates one of three credential kinds and produces a typed principal.
pub struct CredentialVerifier {
    tenants: Arc<dyn TenantStore>,
    cache: Arc<dyn SharedCache>,
    jwt: JwtManager,
    keys: KeyManager,
}

impl CredentialVerifier {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        cache: Arc<dyn SharedCache>,
        jwt: JwtManager,
        keys: KeyManager,
    ) -> Self {
        Self {
            tenants,
            cache,
            jwt,
            keys,
        }
    }

    /// Verify credential material. Any failure refuses the connection
    /// attempt before session state exists.
    pub async fn verify(&self, credential: &Credential) -> CoreResult<Principal> {
        match credential {
            Credential::PluginKey { key, member_id } => {
                self.verify_plugin_key(key, member_id).await
            }
            Credential::ApiKey { key, secret } => self.verify_api_key(key, secret).await,
            Credential::Bearer { token } => self.verify_bearer(token).await,
        }
    }

    async fn verify_plugin_key(&self, key: &str, member_id: &str) -> CoreResult<Principal> {
        if !KeyManager::plugin_key_format_ok(key) || member_id.is_empty() {
            return Err(CoreError::InvalidCredential);
        }

        let env = self.active_environment(|| {
            let tenants = Arc::clone(&self.tenants);
            let key = key.to_string();
            async move { tenants.environment_by_plugin_key(&key).await }
        })
        .await?;

        Ok(Principal::EndUser {
            member_id: member_id.to_string(),
            org_id: env.organization_id,
            env_id: env.id,
        })
    }

    async fn verify_api_key(&self, key: &str, secret: &str) -> CoreResult<Principal> {
        // Signature check rejects forged keys without a store round trip
        if !self
            .keys
            .validate_api_key(key)
            .map_err(|_| CoreError::InvalidCredential)?
        {
            return Err(CoreError::InvalidCredential);
        }

        let env = self.active_environment(|| {
            let tenants = Arc::clone(&self.tenants);
            let key = key.to_string();
            async move { tenants.environment_by_api_key(&key).await }
        })
        .await?;

        if !keys::verify_secret(secret, &env.api_secret_hash) {
            tracing::warn!(env_id = %env.id, "API secret mismatch");
            return Err(CoreError::InvalidCredential);
        }

        Ok(Principal::BackendService {
            org_id: env.organization_id,
            env_id: env.id,
        })
    }

    async fn verify_bearer(&self, token: &str) -> CoreResult<Principal> {
        let claims = self.jwt.validate_access_token(token).map_err(|e| match e {
            jwt::JwtError::Expired => CoreError::ExpiredCredential,
            _ => CoreError::InvalidCredential,
        })?;

        // Revoked tokens are tracked by JTI in the shared cache
        let blacklist_key = format!("jwt_blacklist:{}", claims.jti);
        if self.cache.exists(&blacklist_key).await? {
            return Err(CoreError::RevokedCredential);
        }

        let agent = retry_read(|| {
            let tenants = Arc::clone(&self.tenants);
            async move { tenants.agent_by_id(claims.sub).await }
        })
        .await?
        .ok_or(CoreError::InvalidCredential)?;

        if !agent.is_active || agent.organization_id != claims.org_id {
            return Err(CoreError::RevokedCredential);
        }
        if !self.org_active(agent.organization_id).await? {
            return Err(CoreError::RevokedCredential);
        }

        Ok(Principal::Agent {
            id: agent.id,
            org_id: agent.organization_id,
            email: agent.email,
            name: agent.name,
            role: agent.role,
        })
    }

    async fn active_environment<F, Fut>(&self, lookup: F) -> CoreResult<EnvironmentRecord>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CoreResult<Option<EnvironmentRecord>>>,
    {
        let env = retry_read(lookup)
            .await?
            .ok_or(CoreError::InvalidCredential)?;

        if !env.is_active {
            return Err(CoreError::RevokedCredential);
        }
        if !self.org_active(env.organization_id).await? {
            return Err(CoreError::RevokedCredential);
        }
        Ok(env)
    }

    async fn org_active(&self, org_id: Uuid) -> CoreResult<bool> {
        retry_read(|| {
            let tenants = Arc::clone(&self.tenants);
            async move { tenants.organization_active(org_id).await }
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use crate::store::MemoryTenantStore;
    use livedesk_shared::{EnvKind, MemoryCache};

    const JWT_SECRET: &str = "test-secret-key-at-least-32-chars!";
    const HMAC_SECRET: &str = "test-hmac-secret-32-chars-minimum!";

    struct Fixture {
        verifier: CredentialVerifier,
        tenants: Arc<MemoryTenantStore>,
        cache: Arc<MemoryCache>,
        jwt: JwtManager,
        keys: KeyManager,
    }

    async fn fixture() -> Fixture {
        let tenants = Arc::new(MemoryTenantStore::new());
        let cache = Arc::new(MemoryCache::new());
        let jwt = JwtManager::new(JWT_SECRET, 24);
        let keys = KeyManager::new(HMAC_SECRET);
        let verifier = CredentialVerifier::new(
            Arc::clone(&tenants) as Arc<dyn TenantStore>,
            Arc::clone(&cache) as Arc<dyn SharedCache>,
            jwt.clone(),
            keys.clone(),
        );
        Fixture {
            verifier,
            tenants,
            cache,
            jwt,
            keys,
        }
    }

    async fn seed_environment(f: &Fixture, active: bool) -> (EnvironmentRecord, String) {
        let (secret, hash) = f.keys.generate_api_secret().unwrap();
        let env = EnvironmentRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            kind: EnvKind::Production,
            plugin_key: f.keys.generate_plugin_key(),
            api_key: f.keys.generate_api_key().unwrap(),
            api_secret_hash: hash,
            allowed_origins: vec![],
            is_active: active,
            connection_rate_per_minute: None,
            message_rate_per_minute: None,
        };
        f.tenants.add_environment(env.clone()).await;
        (env, secret)
    }

    #[tokio::test]
    async fn test_plugin_key_produces_end_user_in_issuing_tenant() {
        let f = fixture().await;
        let (env, _) = seed_environment(&f, true).await;

        let principal = f
            .verifier
            .verify(&Credential::PluginKey {
                key: env.plugin_key.clone(),
                member_id: "visitor-7".to_string(),
            })
            .await
            .unwrap();

        match principal {
            Principal::EndUser {
                member_id,
                org_id,
                env_id,
            } => {
                assert_eq!(member_id, "visitor-7");
                assert_eq!(org_id, env.organization_id);
                assert_eq!(env_id, env.id);
            }
            other => panic!("expected EndUser, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_plugin_key_rejected() {
        let f = fixture().await;
        let key = f.keys.generate_plugin_key();
        let result = f
            .verifier
            .verify(&Credential::PluginKey {
                key,
                member_id: "visitor".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_inactive_environment_is_revoked() {
        let f = fixture().await;
        let (env, _) = seed_environment(&f, false).await;
        let result = f
            .verifier
            .verify(&Credential::PluginKey {
                key: env.plugin_key,
                member_id: "visitor".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::RevokedCredential)));
    }

    #[tokio::test]
    async fn test_api_key_with_wrong_secret_rejected() {
        let f = fixture().await;
        let (env, _) = seed_environment(&f, true).await;
        let result = f
            .verifier
            .verify(&Credential::ApiKey {
                key: env.api_key,
                secret: "wrong".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::InvalidCredential)));
    }

    #[tokio::test]
    async fn test_api_key_with_secret_produces_backend_principal() {
        let f = fixture().await;
        let (env, secret) = seed_environment(&f, true).await;
        let principal = f
            .verifier
            .verify(&Credential::ApiKey {
                key: env.api_key,
                secret,
            })
            .await
            .unwrap();
        assert!(matches!(principal, Principal::BackendService { org_id, .. } if org_id == env.organization_id));
    }

    #[tokio::test]
    async fn test_bearer_token_produces_agent_principal() {
        let f = fixture().await;
        let agent = crate::store::AgentRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            name: Some("Ana".to_string()),
            role: "agent".to_string(),
            is_active: true,
            concurrency_limit: Some(5),
        };
        f.tenants.add_agent(agent.clone()).await;

        let (token, _) = f
            .jwt
            .generate_access_token(
                agent.id,
                agent.organization_id,
                "agent",
                "a@example.com",
                Some("Ana"),
            )
            .unwrap();

        let principal = f
            .verifier
            .verify(&Credential::Bearer { token })
            .await
            .unwrap();
        assert!(matches!(principal, Principal::Agent { id, .. } if id == agent.id));
    }

    #[tokio::test]
    async fn test_blacklisted_jti_is_revoked() {
        let f = fixture().await;
        let agent = crate::store::AgentRecord {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            name: None,
            role: "agent".to_string(),
            is_active: true,
            concurrency_limit: None,
        };
        f.tenants.add_agent(agent.clone()).await;

        let (token, jti) = f
            .jwt
            .generate_access_token(agent.id, agent.organization_id, "agent", "a@example.com", None)
            .unwrap();
        f.cache
            .set(&format!("jwt_blacklist:{jti}"), "1", None)
            .await
            .unwrap();

        let result = f.verifier.verify(&Credential::Bearer { token }).await;
        assert!(matches!(result, Err(CoreError::RevokedCredential)));
    }

    #[tokio::test]
    async fn test_garbage_bearer_token_rejected() {
        let f = fixture().await;
        let result = f
            .verifier
            .verify(&Credential::Bearer {
                token: "not-a-jwt".to_string(),
            })
            .await;
        assert!(matches!(result, Err(CoreError::InvalidCredential)));
    }
}
