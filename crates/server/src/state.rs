//! Shared application state
//!
//! Wires the verifier, resolver, registry, router, and guard together and
//! owns the background maintenance loop (idle sweep, typing auto-clear,
//! waiting-conversation retry).

use std::sync::Arc;
use std::time::Duration;

use livedesk_shared::SharedCache;

use crate::auth::{CredentialVerifier, JwtManager, KeyManager};
use crate::config::Config;
use crate::dispatch::ServerEvent;
use crate::guard::{AdmissionGuard, GuardConfig};
use crate::presence::SessionRegistry;
use crate::router::{ConversationRouter, TypingTracker};
use crate::store::{ConversationStore, TenantStore};
use crate::tenant::{LimitDefaults, TenantResolver};
use livedesk_shared::AgentStatus;

/// Shared state behind every connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<dyn SharedCache>,
    pub tenants: Arc<dyn TenantStore>,
    pub verifier: Arc<CredentialVerifier>,
    pub resolver: Arc<TenantResolver>,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<ConversationRouter>,
    pub guard: Arc<AdmissionGuard>,
}

impl AppState {
    pub fn build(
        config: Config,
        tenants: Arc<dyn TenantStore>,
        conversations: Arc<dyn ConversationStore>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let keys = KeyManager::new(&config.api_key_hmac_secret);

        let verifier = Arc::new(CredentialVerifier::new(
            Arc::clone(&tenants),
            Arc::clone(&cache),
            jwt,
            keys,
        ));
        let resolver = Arc::new(TenantResolver::new(
            Arc::clone(&tenants),
            Arc::clone(&cache),
            config.tenant_cache_ttl(),
            LimitDefaults {
                connection_rate_per_minute: config.default_connection_rate_per_minute,
                message_rate_per_minute: config.default_message_rate_per_minute,
            },
        ));
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&cache),
            config.default_agent_concurrency,
            config.presence_ttl(),
        ));
        let router = Arc::new(ConversationRouter::new(
            conversations,
            Arc::clone(&tenants),
            Arc::clone(&registry),
            Arc::clone(&cache),
            TypingTracker::new(config.typing_idle()),
        ));
        let guard = Arc::new(AdmissionGuard::new(
            Arc::clone(&cache),
            GuardConfig {
                window: Duration::from_secs(60),
                ban_threshold: config.ban_threshold,
                ban_ttl: config.ban_ttl(),
                ..GuardConfig::default()
            },
        ));

        Self {
            config: Arc::new(config),
            cache,
            tenants,
            verifier,
            resolver,
            registry,
            router,
            guard,
        }
    }

    /// Periodic maintenance: deregister dead sessions, keep cache mirrors
    /// alive, auto-clear stale typing states, retry waiting conversations,
    /// close abandoned ones.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(state.config.sweep_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                state.run_sweep().await;
            }
        })
    }

    async fn run_sweep(&self) {
        let stale = self
            .registry
            .idle_sessions(self.config.heartbeat_timeout())
            .await;
        for session_id in stale {
            tracing::info!(session_id = %session_id, "deregistering idle session");
            crate::dispatch::cleanup_session(self, session_id).await;
        }

        if let Err(e) = self.registry.refresh_mirrors().await {
            tracing::warn!(error = ?e, "presence mirror refresh failed");
        }

        self.router.sweep_typing().await;

        match self
            .router
            .close_idle(self.config.conversation_idle_close())
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::info!(closed = n, "closed conversations idle past the timeout"),
            Err(e) => tracing::warn!(error = ?e, "idle conversation sweep failed"),
        }

        for org_id in self.registry.agent_orgs().await {
            match self.router.sweep_waiting(org_id).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(org_id = %org_id, assigned = n, "waiting sweep assigned conversations"),
                Err(e) => tracing::warn!(org_id = %org_id, error = ?e, "waiting sweep failed"),
            }
        }
    }

    /// Org-wide agent status fan-out, used on connect, explicit change,
    /// and disconnect.
    pub async fn broadcast_agent_status(
        &self,
        org_id: uuid::Uuid,
        agent_id: uuid::Uuid,
        status: AgentStatus,
    ) {
        self.registry
            .broadcast_org_agents(org_id, ServerEvent::AgentStatusChanged { agent_id, status })
            .await;
    }
}
