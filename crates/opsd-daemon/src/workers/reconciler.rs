//! Periodic fallback reconciler.
//!
//! Used only when expiration notifications are unavailable: every minute
//! it walks all agent ids and forces offline any agent whose `last_seen`
//! cache entry has lapsed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use opsd_core::presence::PresenceCache;

use crate::storage::Storage;

use super::offline_last_seen;

/// Sweep interval.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Start the periodic reconciler on its own task.
pub fn start_periodic_reconciler(
    cache: Arc<dyn PresenceCache>,
    storage: Storage,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    info!("periodic presence reconciler started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh start
        // does not race heartbeats still in flight.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            reconcile_once(cache.as_ref(), &storage).await;
        }
    })
}

async fn reconcile_once(cache: &dyn PresenceCache, storage: &Storage) {
    let agent_ids = match storage.list_agent_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "reconciler agent listing failed");
            return;
        }
    };

    for agent_id in agent_ids {
        match cache.get_last_seen(&agent_id).await {
            // Entry still alive: the agent is current.
            Ok(Some(_)) => {}
            Ok(None) => {
                let last_seen_at = offline_last_seen(None, Utc::now());
                if let Err(e) = storage.mark_agent_offline(&agent_id, last_seen_at).await {
                    warn!(agent_id, error = %e, "reconciler mark offline failed");
                }
            }
            Err(e) => {
                warn!(agent_id, error = %e.0, "reconciler cache lookup failed");
            }
        }
    }
}
