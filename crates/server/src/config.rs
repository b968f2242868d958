//! Application configuration

use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,

    // Authentication
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub api_key_hmac_secret: String,

    // Tenant resolution
    pub tenant_cache_ttl_secs: u64,

    // Session lifecycle
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub typing_idle_secs: u64,

    // Admission defaults (per-environment overrides win)
    pub default_connection_rate_per_minute: u32,
    pub default_message_rate_per_minute: u32,
    pub ban_threshold: u32,
    pub ban_ttl_secs: u64,

    // Routing
    pub default_agent_concurrency: u32,
    pub conversation_idle_close_secs: u64,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: var_or("DATABASE_MAX_CONNECTIONS", 20),

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            jwt_expiry_hours: var_or("JWT_EXPIRY_HOURS", 24),
            api_key_hmac_secret: {
                let secret = env::var("API_KEY_HMAC_SECRET")
                    .map_err(|_| ConfigError::Missing("API_KEY_HMAC_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "API_KEY_HMAC_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            tenant_cache_ttl_secs: var_or("TENANT_CACHE_TTL_SECS", 300),

            heartbeat_timeout_secs: var_or("HEARTBEAT_TIMEOUT_SECS", 90),
            sweep_interval_secs: var_or("SWEEP_INTERVAL_SECS", 30),
            typing_idle_secs: var_or("TYPING_IDLE_SECS", 6),

            default_connection_rate_per_minute: var_or("DEFAULT_CONNECTION_RATE_PER_MINUTE", 30),
            default_message_rate_per_minute: var_or("DEFAULT_MESSAGE_RATE_PER_MINUTE", 120),
            ban_threshold: var_or("BAN_THRESHOLD", 5),
            ban_ttl_secs: var_or("BAN_TTL_SECS", 300),

            default_agent_concurrency: var_or("DEFAULT_AGENT_CONCURRENCY", 5),
            conversation_idle_close_secs: var_or("CONVERSATION_IDLE_CLOSE_SECS", 3600),
        })
    }

    pub fn tenant_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tenant_cache_ttl_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_secs(self.typing_idle_secs)
    }

    pub fn ban_ttl(&self) -> Duration {
        Duration::from_secs(self.ban_ttl_secs)
    }

    pub fn conversation_idle_close(&self) -> Duration {
        Duration::from_secs(self.conversation_idle_close_secs)
    }

    /// Lifetime of presence/session cache mirrors. One full sweep interval
    /// of headroom past the heartbeat timeout keeps live records from
    /// lapsing between refreshes.
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs + self.sweep_interval_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
