//! Admission and rate guarding
//!
//! Fixed-window counters in the shared cache, per tenant scope and per
//! principal, on connection attempts and message events. Repeated
//! violations earn a temporary ban key that refuses connection attempts
//! until it expires.

use std::sync::Arc;
use std::time::Duration;

use livedesk_shared::{CoreError, CoreResult, SharedCache};

use crate::tenant::TenantContext;

#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Counter window; limits are expressed per minute.
    pub window: Duration,
    /// Violations within the violation window before a ban is written.
    pub ban_threshold: u32,
    pub ban_ttl: Duration,
    /// Headroom multiplier for the tenant-wide aggregate over the
    /// per-principal limit.
    pub tenant_burst_factor: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            ban_threshold: 5,
            ban_ttl: Duration::from_secs(300),
            tenant_burst_factor: 20,
        }
    }
}

/// Guards connection admission and message throughput.
pub struct AdmissionGuard {
    cache: Arc<dyn SharedCache>,
    config: GuardConfig,
}

impl AdmissionGuard {
    pub fn new(cache: Arc<dyn SharedCache>, config: GuardConfig) -> Self {
        Self { cache, config }
    }

    /// Windowed increment; sets the expiry when the window opens.
    async fn bump(&self, key: &str, window: Duration) -> CoreResult<i64> {
        let count = self.cache.incr(key).await?;
        if count == 1 {
            self.cache.expire(key, window).await?;
        }
        Ok(count)
    }

    async fn over_limit(&self, key: &str, limit: u32) -> CoreResult<bool> {
        Ok(self.bump(key, self.config.window).await? > i64::from(limit))
    }

    /// Record a violation; over the threshold, write the ban key.
    async fn record_violation(&self, rate_key: &str) -> CoreResult<CoreError> {
        let key = format!("viol:{rate_key}");
        let violations = self.bump(&key, self.config.ban_ttl).await?;
        if violations >= i64::from(self.config.ban_threshold) {
            self.cache
                .set(&format!("ban:{rate_key}"), "1", Some(self.config.ban_ttl))
                .await?;
            tracing::warn!(rate_key = %rate_key, violations, "principal banned");
            return Ok(CoreError::Banned);
        }
        Ok(CoreError::RateLimited)
    }

    pub async fn is_banned(&self, rate_key: &str) -> CoreResult<bool> {
        self.cache.exists(&format!("ban:{rate_key}")).await
    }

    /// Gate a connection attempt. Banned principals are refused outright;
    /// over-rate attempts count toward a ban.
    pub async fn check_connection(
        &self,
        tenant: &TenantContext,
        rate_key: &str,
    ) -> CoreResult<()> {
        if self.is_banned(rate_key).await? {
            return Err(CoreError::Banned);
        }

        let limit = tenant.limits.connection_rate_per_minute;
        let tenant_key = format!("rate:conn:{}:{}", tenant.org_id, tenant.env_id);
        let principal_key = format!("rate:conn:p:{rate_key}");

        if self
            .over_limit(&tenant_key, limit.saturating_mul(self.config.tenant_burst_factor))
            .await?
            || self.over_limit(&principal_key, limit).await?
        {
            return Err(self.record_violation(rate_key).await?);
        }
        Ok(())
    }

    /// Gate one inbound message event.
    pub async fn check_message(&self, tenant: &TenantContext, rate_key: &str) -> CoreResult<()> {
        let limit = tenant.limits.message_rate_per_minute;
        let tenant_key = format!("rate:msg:{}:{}", tenant.org_id, tenant.env_id);
        let principal_key = format!("rate:msg:p:{rate_key}");

        if self
            .over_limit(&tenant_key, limit.saturating_mul(self.config.tenant_burst_factor))
            .await?
            || self.over_limit(&principal_key, limit).await?
        {
            return Err(self.record_violation(rate_key).await?);
        }
        Ok(())
    }
}
