//! Inventory consumer: discovery snapshots, deduplicated by content hash.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use opsd_core::batch::BatchSizer;
use opsd_core::wire::{decode, Inventory};

use crate::bus::Bus;
use crate::storage::{Storage, StorageError};

use super::{durable_consumer, run_pull_loop, Disposition, MessageProcessor};

const DURABLE_NAME: &str = "backend-inventory";
const FILTER_SUBJECT: &str = "ops.*.inventory";

const INITIAL_FETCH: usize = 64;
const MIN_FETCH: usize = 32;
const MAX_FETCH: usize = 256;

struct InventoryProcessor {
    storage: Storage,
}

#[async_trait]
impl MessageProcessor for InventoryProcessor {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn process(
        &self,
        message: &async_nats::jetstream::Message,
    ) -> Result<Disposition, StorageError> {
        let inventory: Inventory = match decode(&message.payload) {
            Ok(inventory) => inventory,
            Err(e) => {
                error!(subject = %message.subject, error = %e, "undecodable inventory, terminating");
                return Ok(Disposition::Terminate);
            }
        };

        let Some(agent_id) = agent_id_from_subject(message.subject.as_str()) else {
            error!(subject = %message.subject, "unexpected inventory subject, terminating");
            return Ok(Disposition::Terminate);
        };

        // Canonical JSON is the dedup unit: identical snapshots hash
        // identically regardless of msgpack framing.
        let payload = serde_json::to_value(&inventory)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let canonical =
            serde_json::to_vec(&payload).map_err(|e| StorageError::Internal(e.to_string()))?;
        let hash = hex_digest(&canonical);

        let inserted = self
            .storage
            .insert_inventory_snapshot(agent_id, &hash, &payload)
            .await?;

        if inserted {
            info!(agent_id, hash = %&hash[..8], "inventory snapshot stored");
        } else {
            debug!(agent_id, hash = %&hash[..8], "inventory snapshot unchanged");
        }

        Ok(Disposition::Ack)
    }
}

/// Start the durable inventory consumer on its own task.
///
/// # Errors
///
/// Returns an error when the durable consumer cannot be created.
pub async fn start_inventory_consumer(
    bus: &Bus,
    storage: Storage,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let consumer = durable_consumer(&bus.jetstream, DURABLE_NAME, FILTER_SUBJECT).await?;
    let sizer = BatchSizer::new(INITIAL_FETCH, MIN_FETCH, MAX_FETCH);
    let processor = InventoryProcessor { storage };

    Ok(tokio::spawn(run_pull_loop(
        consumer, sizer, processor, cancel,
    )))
}

/// Extract the agent id from an `ops.{agentId}.inventory` subject.
fn agent_id_from_subject(subject: &str) -> Option<&str> {
    let mut parts = subject.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("ops"), Some(agent_id), Some("inventory"), None) if !agent_id.is_empty() => {
            Some(agent_id)
        }
        _ => None,
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_from_subject() {
        assert_eq!(
            agent_id_from_subject("ops.a1b2c3d4e5f6.inventory"),
            Some("a1b2c3d4e5f6")
        );
        assert_eq!(agent_id_from_subject("ops.a1b2c3d4e5f6.events.alert"), None);
        assert_eq!(agent_id_from_subject("ops.inventory"), None);
        assert_eq!(agent_id_from_subject("ops..inventory"), None);
        assert_eq!(
            agent_id_from_subject("ops.a1b2c3d4e5f6.inventory.extra"),
            None
        );
    }

    #[test]
    fn test_hex_digest_is_stable() {
        let one = hex_digest(b"payload");
        let two = hex_digest(b"payload");
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);
        assert_ne!(hex_digest(b"other"), one);
    }

    #[test]
    fn test_identical_inventories_hash_identically() {
        let inv: Inventory = decode(
            &opsd_core::wire::encode(&serde_json::json!({
                "platform": "ubuntu",
                "platform_version": "24.04",
                "candidates": [],
            }))
            .unwrap(),
        )
        .unwrap();

        let a = serde_json::to_vec(&serde_json::to_value(&inv).unwrap()).unwrap();
        let b = serde_json::to_vec(&serde_json::to_value(&inv).unwrap()).unwrap();
        assert_eq!(hex_digest(&a), hex_digest(&b));
    }
}
