//! Request-reply dispatch to individual agents.
//!
//! Requests go to `ops.{agentId}.rpc` as msgpack-encoded actions; the
//! reply is awaited on the client inbox. "No responders" and a lapsed
//! deadline are distinguishable failures so callers can tell an offline
//! agent from a slow one.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use opsd_core::error::RpcError;
use opsd_core::wire::{decode, encode, ActionRequest, ActionResponse};

/// Grace added on top of the agent-side execution budget.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Smallest overall wait.
const DEADLINE_FLOOR: Duration = Duration::from_secs(15);

/// Largest overall wait.
const DEADLINE_CEILING: Duration = Duration::from_secs(125);

/// Dispatches actions to agents over the bus.
#[derive(Clone)]
pub struct RpcDispatcher {
    client: async_nats::Client,
}

impl RpcDispatcher {
    /// Wrap a connected client.
    #[must_use]
    pub const fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Execute an action on an agent and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::AgentOffline`] when nothing subscribes to the
    /// agent's RPC subject, [`RpcError::Timeout`] when the deadline
    /// lapses, and decode/transport variants otherwise.
    pub async fn exec_action(
        &self,
        agent_id: &str,
        action: &str,
        args: HashMap<String, String>,
        timeout_ms: u64,
    ) -> Result<ActionResponse, RpcError> {
        let request = ActionRequest {
            action: action.to_string(),
            args,
            request_id: Uuid::new_v4().to_string(),
            timeout_ms: (timeout_ms > 0).then_some(timeout_ms),
        };

        let payload = encode(&request).map_err(|e| RpcError::Encode(e.to_string()))?;
        let deadline = wait_deadline(timeout_ms);
        let subject = format!("ops.{agent_id}.rpc");

        debug!(
            agent_id,
            action,
            request_id = %request.request_id,
            deadline_ms = deadline.as_millis(),
            "dispatching action"
        );

        let reply = self
            .client
            .send_request(
                subject,
                async_nats::Request::new()
                    .payload(payload.into())
                    .timeout(Some(deadline)),
            )
            .await
            .map_err(map_request_error)?;

        decode(&reply.payload).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

fn map_request_error(err: async_nats::RequestError) -> RpcError {
    match err.kind() {
        async_nats::RequestErrorKind::NoResponders => RpcError::AgentOffline,
        async_nats::RequestErrorKind::TimedOut => RpcError::Timeout,
        async_nats::RequestErrorKind::Other => RpcError::Transport(err.to_string()),
    }
}

/// The overall wait deadline for an agent-side budget of `timeout_ms`.
///
/// The agent budget plus a grace period, clamped to `[15s, 125s]`; a zero
/// budget falls to the floor.
fn wait_deadline(timeout_ms: u64) -> Duration {
    (Duration::from_millis(timeout_ms) + DEADLINE_GRACE).clamp(DEADLINE_FLOOR, DEADLINE_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_floor() {
        assert_eq!(wait_deadline(0), Duration::from_secs(15));
        assert_eq!(wait_deadline(1_000), Duration::from_secs(15));
        assert_eq!(wait_deadline(10_000), Duration::from_secs(15));
    }

    #[test]
    fn test_deadline_tracks_budget_plus_grace() {
        assert_eq!(wait_deadline(30_000), Duration::from_secs(35));
        assert_eq!(wait_deadline(60_000), Duration::from_secs(65));
    }

    #[test]
    fn test_deadline_ceiling() {
        assert_eq!(wait_deadline(120_000), Duration::from_secs(125));
        assert_eq!(wait_deadline(200_000), Duration::from_secs(125));
        assert_eq!(wait_deadline(u64::MAX / 2), Duration::from_secs(125));
    }
}
