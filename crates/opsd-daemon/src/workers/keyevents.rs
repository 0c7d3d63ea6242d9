//! Expiration-driven reconciler.
//!
//! Subscribes to cache key expirations; an expired `last_seen` key means
//! the agent missed its presence window, so the agent row flips offline
//! with the best-known timestamp and the cached status mirrors it.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opsd_core::model::AgentStatus;
use opsd_core::presence::{agent_id_from_expired_key, PresenceCache};

use crate::cache::RedisCache;
use crate::storage::Storage;

use super::offline_last_seen;

/// Try to start the keyevent worker.
///
/// Returns `true` when the subscription is live and expiration
/// notifications are configured; `false` tells the caller to fall back to
/// the periodic reconciler instead.
pub async fn start_keyevent_worker(
    cache: Arc<RedisCache>,
    storage: Storage,
    cancel: CancellationToken,
) -> bool {
    let (stream, notifications_enabled) = match cache.subscribe_expired().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e.0, "keyevent subscribe failed");
            return false;
        }
    };

    if !notifications_enabled {
        return false;
    }

    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            let key = tokio::select! {
                () = cancel.cancelled() => return,
                key = stream.next() => key,
            };

            match key {
                Some(key) => handle_expired(cache.as_ref(), &storage, &key).await,
                None => {
                    warn!("keyevent subscription closed");
                    return;
                }
            }
        }
    });

    info!("keyevent worker started");
    true
}

async fn handle_expired(cache: &RedisCache, storage: &Storage, key: &str) {
    let Some(agent_id) = agent_id_from_expired_key(key) else {
        return;
    };

    // The expired key is usually gone along with its value; any copy that
    // survives (e.g. a refresh racing the expiry) is the better timestamp.
    let cached_ms = cache.get_last_seen(agent_id).await.unwrap_or_default();
    let last_seen_at = offline_last_seen(cached_ms, Utc::now());

    if let Err(e) = storage.mark_agent_offline(agent_id, last_seen_at).await {
        warn!(agent_id, error = %e, "mark offline failed");
        return;
    }

    if let Err(e) = cache.set_status(agent_id, AgentStatus::Offline).await {
        warn!(agent_id, error = %e.0, "cache offline status failed");
    }

    info!(agent_id, %last_seen_at, "agent offline (presence expired)");
}
