//! In-process conflict event hub.
//!
//! Fan-out is deliberately lossy: a bounded central queue feeds a single
//! forwarder task which copies each event to every subscriber channel of
//! the owning organization with a non-blocking send. A slow subscriber
//! drops events instead of stalling the publisher; the UI re-fetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::AgentConflict;

/// Capacity of the central publish queue.
const QUEUE_CAPACITY: usize = 100;

/// Capacity of each subscriber channel.
const SUBSCRIBER_CAPACITY: usize = 10;

type SubscriberMap = Arc<RwLock<HashMap<String, HashMap<u64, mpsc::Sender<AgentConflict>>>>>;

struct QueuedConflict {
    org_id: String,
    conflict: AgentConflict,
}

/// Per-organization conflict fan-out.
///
/// Cloning is cheap; all clones publish into the same queue and share the
/// same subscriber map.
#[derive(Clone)]
pub struct ConflictHub {
    subscribers: SubscriberMap,
    queue: mpsc::Sender<QueuedConflict>,
    next_id: Arc<AtomicU64>,
}

impl ConflictHub {
    /// Create a hub and spawn its forwarder task.
    ///
    /// The forwarder exits once every hub clone has been dropped and the
    /// queue has drained.
    #[must_use]
    pub fn new() -> Self {
        let subscribers: SubscriberMap = Arc::default();
        let (queue, mut rx) = mpsc::channel::<QueuedConflict>(QUEUE_CAPACITY);

        let map = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let guard = map.read().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(org_subscribers) = guard.get(&queued.org_id) {
                    for sender in org_subscribers.values() {
                        if sender.try_send(queued.conflict.clone()).is_err() {
                            debug!(org_id = %queued.org_id, "conflict subscriber full, dropping event");
                        }
                    }
                }
            }
        });

        Self {
            subscribers,
            queue,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish a conflict to all subscribers of an organization.
    ///
    /// Waits for queue room; per-subscriber delivery remains non-blocking.
    pub async fn publish(&self, org_id: &str, conflict: AgentConflict) {
        let queued = QueuedConflict {
            org_id: org_id.to_string(),
            conflict,
        };
        if self.queue.send(queued).await.is_err() {
            debug!("conflict hub forwarder stopped, dropping event");
        }
    }

    /// Subscribe to an organization's conflict events.
    ///
    /// The subscription unsubscribes itself on drop; when the last
    /// subscriber of an organization leaves, the map entry is deleted.
    #[must_use]
    pub fn subscribe(&self, org_id: &str) -> ConflictSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);

        let mut map = self
            .subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        map.entry(org_id.to_string()).or_default().insert(id, tx);

        ConflictSubscription {
            subscribers: Arc::clone(&self.subscribers),
            org_id: org_id.to_string(),
            id,
            rx,
        }
    }

    /// Number of live subscribers for an organization.
    #[must_use]
    pub fn subscriber_count(&self, org_id: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(org_id)
            .map_or(0, HashMap::len)
    }
}

impl Default for ConflictHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live subscription to one organization's conflict events.
pub struct ConflictSubscription {
    subscribers: SubscriberMap,
    org_id: String,
    id: u64,
    rx: mpsc::Receiver<AgentConflict>,
}

impl ConflictSubscription {
    /// Receive the next conflict event.
    ///
    /// Returns `None` only after the subscription has been closed.
    pub async fn recv(&mut self) -> Option<AgentConflict> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    ///
    /// # Errors
    ///
    /// Returns the underlying channel error when empty or disconnected.
    pub fn try_recv(&mut self) -> Result<AgentConflict, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl Drop for ConflictSubscription {
    fn drop(&mut self) {
        let mut map = self
            .subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(org_subscribers) = map.get_mut(&self.org_id) {
            org_subscribers.remove(&self.id);
            if org_subscribers.is_empty() {
                map.remove(&self.org_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::model::ConflictResolution;

    fn sample_conflict(agent_id: &str) -> AgentConflict {
        AgentConflict {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            existing_ip: "10.0.0.1".to_string(),
            new_ip: "10.0.0.2".to_string(),
            existing_hostname: Some("web-01".to_string()),
            new_hostname: Some("web-02".to_string()),
            resolution: ConflictResolution::Pending,
            resolved_by: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_org_events() {
        let hub = ConflictHub::new();
        let mut sub = hub.subscribe("org-a");

        hub.publish("org-a", sample_conflict("abc123456789")).await;

        let received = sub.recv().await.unwrap();
        assert_eq!(received.agent_id, "abc123456789");
    }

    #[tokio::test]
    async fn test_events_are_routed_per_org() {
        let hub = ConflictHub::new();
        let mut sub_a = hub.subscribe("org-a");
        let mut sub_b = hub.subscribe("org-b");

        hub.publish("org-b", sample_conflict("abc123456789")).await;

        assert_eq!(sub_b.recv().await.unwrap().agent_id, "abc123456789");
        // org-a saw nothing.
        tokio::task::yield_now().await;
        assert!(sub_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_instead_of_blocking() {
        let hub = ConflictHub::new();
        let mut sub = hub.subscribe("org-a");

        // Well past the subscriber capacity; publish must not stall.
        for i in 0..50 {
            hub.publish("org-a", sample_conflict(&format!("agent{i:06}")))
                .await;
        }

        // Give the forwarder time to drain the queue.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut received = 0;
        while sub.try_recv().is_ok() {
            received += 1;
        }
        assert!(received > 0);
        assert!(received <= 10, "subscriber got {received}, capacity is 10");
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_and_cleans_map() {
        let hub = ConflictHub::new();
        let sub_one = hub.subscribe("org-a");
        let sub_two = hub.subscribe("org-a");
        assert_eq!(hub.subscriber_count("org-a"), 2);

        drop(sub_one);
        assert_eq!(hub.subscriber_count("org-a"), 1);

        drop(sub_two);
        assert_eq!(hub.subscriber_count("org-a"), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = ConflictHub::new();
        hub.publish("org-a", sample_conflict("abc123456789")).await;
        // Nothing to assert beyond "did not panic / block".
        assert_eq!(hub.subscriber_count("org-a"), 0);
    }
}
