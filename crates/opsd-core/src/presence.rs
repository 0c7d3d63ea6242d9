//! Presence-cache interface and key layout.
//!
//! Two entry families exist per agent: a short-TTL "last seen" unix-ms
//! timestamp refreshed by every heartbeat, and a long-lived status marker.
//! Expiration notifications carry the literal key name so the reconciler
//! can recover the agent id by stripping the fixed prefix.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::model::AgentStatus;

/// TTL applied to every `last_seen` write.
pub const LAST_SEEN_TTL: Duration = Duration::from_secs(150);

/// Key prefix for `last_seen` entries.
pub const LAST_SEEN_KEY_PREFIX: &str = "ops:agent:last_seen:";

/// Key prefix for status entries.
pub const STATUS_KEY_PREFIX: &str = "ops:agent:status:";

/// The `last_seen` key for an agent.
#[must_use]
pub fn last_seen_key(agent_id: &str) -> String {
    format!("{LAST_SEEN_KEY_PREFIX}{agent_id}")
}

/// The status key for an agent.
#[must_use]
pub fn status_key(agent_id: &str) -> String {
    format!("{STATUS_KEY_PREFIX}{agent_id}")
}

/// Recover the agent id from an expired `last_seen` key, if it is one.
#[must_use]
pub fn agent_id_from_expired_key(key: &str) -> Option<&str> {
    key.strip_prefix(LAST_SEEN_KEY_PREFIX)
}

/// Volatile per-agent presence state.
///
/// Implementations are expected to bound each call with their own short
/// deadline; cache slowness must degrade freshness, never ingest.
#[async_trait]
pub trait PresenceCache: Send + Sync {
    /// Record presence evidence. Overwrites the TTL on every call.
    async fn set_last_seen(
        &self,
        agent_id: &str,
        ts_ms: i64,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Read the last presence evidence, `None` once the TTL has lapsed.
    async fn get_last_seen(&self, agent_id: &str) -> Result<Option<i64>, CacheError>;

    /// Record the agent's cached status. No TTL.
    async fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), CacheError>;

    /// Read the agent's cached status.
    async fn get_status(&self, agent_id: &str) -> Result<Option<AgentStatus>, CacheError>;

    /// Increment a counter, arming the window TTL on first increment.
    /// Returns the new count.
    async fn incr_with_ttl(&self, key: &str, window: Duration) -> Result<i64, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            last_seen_key("a1b2c3d4e5f6"),
            "ops:agent:last_seen:a1b2c3d4e5f6"
        );
        assert_eq!(status_key("a1b2c3d4e5f6"), "ops:agent:status:a1b2c3d4e5f6");
    }

    #[test]
    fn test_expired_key_strip() {
        assert_eq!(
            agent_id_from_expired_key("ops:agent:last_seen:a1b2c3d4e5f6"),
            Some("a1b2c3d4e5f6")
        );
        assert_eq!(
            agent_id_from_expired_key("ops:agent:status:a1b2c3d4e5f6"),
            None
        );
        assert_eq!(agent_id_from_expired_key("unrelated"), None);
    }
}
