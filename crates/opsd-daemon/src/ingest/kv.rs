//! Heartbeat KV watcher.
//!
//! Watches every key of the `AGENTS` bucket. A put refreshes the presence
//! cache and flips offline agents back online; a delete is a graceful
//! sign-off and marks the agent offline in storage. The watch loop never
//! aborts on a storage or cache error - presence is best-effort.

use std::sync::Arc;

use async_nats::jetstream::kv::{Operation, Store};
use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opsd_core::model::AgentStatus;
use opsd_core::presence::{PresenceCache, LAST_SEEN_TTL};
use opsd_core::wire::{decode, Heartbeat};

use crate::storage::Storage;

/// Start the KV watcher on its own task.
///
/// # Errors
///
/// Returns an error when the watch cannot be established.
pub async fn start_kv_watcher(
    kv: Store,
    storage: Storage,
    cache: Arc<dyn PresenceCache>,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut watch = kv.watch_all().await?;
    info!("kv watcher started");

    let handle = tokio::spawn(async move {
        loop {
            let entry = tokio::select! {
                () = cancel.cancelled() => {
                    info!("kv watcher stopped");
                    return;
                }
                entry = watch.next() => entry,
            };

            match entry {
                Some(Ok(entry)) => handle_entry(&storage, cache.as_ref(), &entry).await,
                Some(Err(e)) => warn!(error = %e, "kv watch error"),
                None => {
                    warn!("kv watch closed");
                    return;
                }
            }
        }
    });

    Ok(handle)
}

async fn handle_entry(
    storage: &Storage,
    cache: &dyn PresenceCache,
    entry: &async_nats::jetstream::kv::Entry,
) {
    let agent_id = entry.key.as_str();

    match entry.operation {
        Operation::Put => handle_heartbeat(storage, cache, agent_id, &entry.value).await,
        Operation::Delete => {
            if let Err(e) = storage
                .update_agent_status(agent_id, AgentStatus::Offline)
                .await
            {
                error!(agent_id, error = %e, "mark offline failed");
                return;
            }
            info!(agent_id, "agent offline (graceful)");
        }
        Operation::Purge => {
            info!(agent_id, "agent purged");
        }
    }
}

async fn handle_heartbeat(
    storage: &Storage,
    cache: &dyn PresenceCache,
    agent_id: &str,
    value: &[u8],
) {
    let heartbeat: Heartbeat = match decode(value) {
        Ok(hb) => hb,
        Err(e) => {
            error!(agent_id, error = %e, "undecodable heartbeat");
            return;
        }
    };

    let now = Utc::now();
    if let Err(e) = cache
        .set_last_seen(agent_id, now.timestamp_millis(), LAST_SEEN_TTL)
        .await
    {
        warn!(agent_id, error = %e.0, "record last_seen failed");
    }

    // A heartbeat from an agent cached as anything but online flips it
    // back; the status key also seeds on the first heartbeat ever seen.
    let cached_status = cache.get_status(agent_id).await.unwrap_or_else(|e| {
        warn!(agent_id, error = %e.0, "read cached status failed");
        None
    });

    if cached_status != Some(AgentStatus::Online) {
        if let Err(e) = storage
            .update_agent_status(agent_id, AgentStatus::Online)
            .await
        {
            error!(agent_id, error = %e, "mark online failed");
        }
        if let Err(e) = cache.set_status(agent_id, AgentStatus::Online).await {
            warn!(agent_id, error = %e.0, "cache online status failed");
        }
        info!(agent_id, hostname = %heartbeat.hostname, "agent online");
    }

    // Inventory-bearing heartbeats refresh the stored metadata.
    if heartbeat.inventory.is_some() {
        let meta = serde_json::to_value(&heartbeat).unwrap_or_else(|_| serde_json::json!({}));
        if let Err(e) = storage
            .update_agent_meta_and_hostname(agent_id, meta, &heartbeat.hostname)
            .await
        {
            error!(agent_id, error = %e, "refresh agent meta failed");
        }
    }

    debug!(
        agent_id,
        hostname = %heartbeat.hostname,
        cpu_percent = heartbeat.cpu_percent,
        mem_percent = heartbeat.mem_percent,
        "agent heartbeat"
    );
}
