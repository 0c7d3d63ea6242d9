//! Redis presence cache.
//!
//! Implements [`PresenceCache`] over a multiplexed connection. Every call
//! is bounded by a short deadline so cache slowness degrades presence
//! freshness instead of stalling ingest. Expiration notifications arrive
//! through the keyspace-notification channel `__keyevent@{db}__:expired`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use opsd_core::error::CacheError;
use opsd_core::model::AgentStatus;
use opsd_core::presence::{last_seen_key, status_key, PresenceCache};

/// Deadline applied to every cache command.
const COMMAND_DEADLINE: Duration = Duration::from_secs(2);

/// Deadline for connection establishment.
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// The daemon's handle to Redis.
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    conn: ConnectionManager,
    db: i64,
}

impl RedisCache {
    /// Connect and ping.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL does not parse or Redis is
    /// unreachable.
    pub async fn connect(url: &str, db_override: Option<i64>) -> Result<Self, CacheError> {
        let mut info = redis::Client::open(url)
            .map_err(|e| CacheError(format!("parse REDIS_URL: {e}")))?
            .get_connection_info()
            .clone();
        if let Some(db) = db_override {
            info.redis.db = db;
        }
        let db = info.redis.db;

        let client =
            redis::Client::open(info).map_err(|e| CacheError(format!("redis client: {e}")))?;
        let conn = tokio::time::timeout(CONNECT_DEADLINE, client.get_connection_manager())
            .await
            .map_err(|_| CacheError("redis connect timed out".to_string()))?
            .map_err(|e| CacheError(format!("redis connect: {e}")))?;

        let cache = Self { client, conn, db };
        cache
            .bounded(async {
                let mut conn = cache.conn.clone();
                redis::cmd("PING")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| CacheError(format!("redis ping: {e}")))
            })
            .await?;

        info!(db, "connected to redis");
        Ok(cache)
    }

    /// Subscribe to key-expiration notifications for this logical
    /// database.
    ///
    /// Returns the stream of expired key names plus whether the server is
    /// actually configured to emit them (`notify-keyspace-events` must
    /// cover keyevent + expired). When the configuration cannot be read,
    /// the subscription is assumed live.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be established.
    pub async fn subscribe_expired(
        &self,
    ) -> Result<(impl Stream<Item = String> + Send, bool), CacheError> {
        let channel = format!("__keyevent@{}__:expired", self.db);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError(format!("redis pubsub: {e}")))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| CacheError(format!("subscribe {channel}: {e}")))?;

        let notifications_enabled = match self.keyspace_notification_flags().await {
            Ok(flags) => {
                let enabled =
                    flags.contains('E') && (flags.contains('x') || flags.contains('A'));
                if !enabled {
                    warn!(flags = %flags, "redis keyspace notifications are not configured");
                }
                enabled
            }
            Err(e) => {
                debug!(error = %e.0, "could not read notify-keyspace-events, assuming enabled");
                true
            }
        };

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            msg.get_payload::<String>().ok()
        });

        Ok((stream, notifications_enabled))
    }

    async fn keyspace_notification_flags(&self) -> Result<String, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .bounded(async move {
                redis::cmd("CONFIG")
                    .arg("GET")
                    .arg("notify-keyspace-events")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CacheError(e.to_string()))
            })
            .await?;

        reply
            .into_iter()
            .nth(1)
            .ok_or_else(|| CacheError("empty CONFIG GET reply".to_string()))
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, CacheError>> + Send,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(COMMAND_DEADLINE, op)
            .await
            .map_err(|_| CacheError("cache call timed out".to_string()))?
    }
}

#[async_trait]
impl PresenceCache for RedisCache {
    async fn set_last_seen(
        &self,
        agent_id: &str,
        ts_ms: i64,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = last_seen_key(agent_id);
        self.bounded(async move {
            conn.set_ex::<_, _, ()>(key, ts_ms, ttl.as_secs())
                .await
                .map_err(|e| CacheError(e.to_string()))
        })
        .await
    }

    async fn get_last_seen(&self, agent_id: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn.clone();
        let key = last_seen_key(agent_id);
        self.bounded(async move {
            conn.get::<_, Option<i64>>(key)
                .await
                .map_err(|e| CacheError(e.to_string()))
        })
        .await
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = status_key(agent_id);
        self.bounded(async move {
            conn.set::<_, _, ()>(key, status.to_string())
                .await
                .map_err(|e| CacheError(e.to_string()))
        })
        .await
    }

    async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>, CacheError> {
        let mut conn = self.conn.clone();
        let key = status_key(agent_id);
        let raw = self
            .bounded(async move {
                conn.get::<_, Option<String>>(key)
                    .await
                    .map_err(|e| CacheError(e.to_string()))
            })
            .await?;

        Ok(raw.and_then(|s| s.parse().ok()))
    }

    async fn incr_with_ttl(&self, key: &str, window: Duration) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded(async move {
            let (count,): (i64,) = redis::pipe()
                .atomic()
                .incr(&key, 1)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(window.as_secs())
                .arg("NX")
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError(e.to_string()))?;
            Ok(count)
        })
        .await
    }
}
