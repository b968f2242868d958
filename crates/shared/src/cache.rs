//! Shared cache abstraction
//!
//! All cross-connection authoritative state (presence, assignment counters,
//! rate counters, sequence counters, tenant-context entries, bans) goes
//! through this interface so a single server talks to the same state a
//! fleet of servers would. Backed by Redis in production; the in-memory
//! implementation backs development and tests.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use crate::error::CoreResult;

/// Key-value cache with the atomic primitives the realtime core relies on:
/// atomic increment (sequence numbers, rate counters), set-if-absent with
/// expiry (assignment locks), and scoped set operations (tenant indexes).
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()>;

    /// Set only if the key does not exist. Returns true if the value was
    /// written. This is the locking primitive for assignment selection.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool>;

    async fn delete(&self, key: &str) -> CoreResult<()>;

    async fn exists(&self, key: &str) -> CoreResult<bool>;

    /// Atomically increment and return the new value. Keys start at zero.
    async fn incr(&self, key: &str) -> CoreResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()>;

    async fn srem(&self, key: &str, member: &str) -> CoreResult<()>;

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>>;
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Redis-backed cache using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!(url = %redis_url, "connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        // SET key value NX EX ttl -- single round trip, atomic
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}

// =============================================================================
// In-memory implementation (development / tests)
// =============================================================================

enum Slot {
    Value(String),
    Set(HashSet<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// In-memory cache with the same semantics as the Redis implementation.
/// Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Called opportunistically by mutating ops.
    async fn evict_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| !e.is_expired());
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|e| {
            if e.is_expired() {
                return None;
            }
            match &e.slot {
                Slot::Value(v) => Some(v.clone()),
                Slot::Set(_) => None,
            }
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool> {
        self.evict_expired().await;
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_expired()) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).is_some_and(|e| !e.is_expired()))
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let mut entries = self.entries.write().await;
        let live = entries.get(key).filter(|e| !e.is_expired());
        let next = match live {
            Some(e) => match &e.slot {
                Slot::Value(v) => v.parse::<i64>().unwrap_or(0) + 1,
                Slot::Set(_) => 1,
            },
            None => 1,
        };
        let expires_at = live.and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        // An already-expired key counts as missing, as EXPIRE does
        match entries.get_mut(key) {
            Some(e) if !e.is_expired() => e.expires_at = Some(Instant::now() + ttl),
            _ => {}
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(e) if !e.is_expired() => {
                if let Slot::Set(set) = &mut e.slot {
                    set.insert(member.to_string());
                    return Ok(());
                }
            }
            _ => {}
        }
        let mut set = HashSet::new();
        set.insert(member.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Set(set),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> CoreResult<()> {
        let mut entries = self.entries.write().await;
        if let Some(Entry {
            slot: Slot::Set(set),
            ..
        }) = entries.get_mut(key)
        {
            set.remove(member);
            if set.is_empty() {
                entries.remove(key);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> CoreResult<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(e) if !e.is_expired() => match &e.slot {
                Slot::Set(set) => set.iter().cloned().collect(),
                Slot::Value(_) => Vec::new(),
            },
            _ => Vec::new(),
        })
    }
}
