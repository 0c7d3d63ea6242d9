//! Connection conflict detection and resolution.
//!
//! Called from the agent-session boundary on connect and disconnect. A
//! connect while another connection is open from a different remote IP
//! records a pending conflict and fans it out to the owning
//! organization's subscribers; the connect itself is always recorded.

use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use opsd_core::hub::ConflictHub;
use opsd_core::model::ConflictResolution;

use crate::storage::{NewConflict, NewConnection, Storage, StorageError};

/// Conflict-resolution failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The resolution value is not one of the accepted requests.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    /// The conflict does not exist.
    #[error("conflict not found")]
    NotFound,

    /// Gateway failure.
    #[error(transparent)]
    Storage(StorageError),
}

/// Detects and resolves agent connection conflicts.
#[derive(Clone)]
pub struct ConflictService {
    storage: Storage,
    hub: ConflictHub,
}

impl ConflictService {
    /// Assemble the service.
    #[must_use]
    pub const fn new(storage: Storage, hub: ConflictHub) -> Self {
        Self { storage, hub }
    }

    /// The fan-out hub, for collaborators serving event streams.
    #[must_use]
    pub const fn hub(&self) -> &ConflictHub {
        &self.hub
    }

    /// Handle an observed agent connect.
    ///
    /// Session-boundary path: failures are logged, never propagated.
    pub async fn on_agent_connect(
        &self,
        agent_id: &str,
        remote_ip: &str,
        hostname: &str,
        client_id: &str,
    ) {
        match self.storage.get_active_connection(agent_id).await {
            Ok(Some(existing)) if existing.remote_ip != remote_ip => {
                self.record_conflict(agent_id, &existing.remote_ip, remote_ip, existing.hostname.as_deref().unwrap_or_default(), hostname)
                    .await;
            }
            Ok(_) => {}
            Err(e) => error!(agent_id, error = %e, "conflict check failed"),
        }

        if let Err(e) = self
            .storage
            .record_agent_connection(&NewConnection {
                agent_id,
                client_id,
                remote_ip,
                hostname,
            })
            .await
        {
            error!(agent_id, error = %e, "connection record failed");
        }
    }

    /// Handle an observed agent disconnect.
    pub async fn on_agent_disconnect(&self, agent_id: &str, reason: &str) {
        if let Err(e) = self.storage.record_agent_disconnect(agent_id, reason).await {
            error!(agent_id, error = %e, "disconnect record failed");
        }
    }

    /// Record an operator's resolution of a conflict.
    ///
    /// Accepts `keep_existing`, `keep_new` and `revoke_both`.
    ///
    /// # Errors
    ///
    /// Returns a typed [`ResolveError`] for unknown values, a missing
    /// conflict or a gateway failure.
    pub async fn resolve(
        &self,
        conflict_id: Uuid,
        resolution_request: &str,
        resolved_by: Uuid,
    ) -> Result<(), ResolveError> {
        let resolution = ConflictResolution::from_request(resolution_request)
            .ok_or_else(|| ResolveError::InvalidResolution(resolution_request.to_string()))?;

        match self
            .storage
            .resolve_conflict(conflict_id, resolution, Some(resolved_by))
            .await
        {
            Ok(()) => {
                info!(
                    conflict_id = %conflict_id,
                    resolution = resolution.as_str(),
                    resolved_by = %resolved_by,
                    "conflict resolved"
                );
                Ok(())
            }
            Err(StorageError::NotFound) => Err(ResolveError::NotFound),
            Err(e) => Err(ResolveError::Storage(e)),
        }
    }

    async fn record_conflict(
        &self,
        agent_id: &str,
        existing_ip: &str,
        new_ip: &str,
        existing_hostname: &str,
        new_hostname: &str,
    ) {
        let conflict = match self
            .storage
            .record_agent_conflict(&NewConflict {
                agent_id,
                existing_ip,
                new_ip,
                existing_hostname,
                new_hostname,
            })
            .await
        {
            Ok(conflict) => conflict,
            Err(e) => {
                error!(agent_id, error = %e, "conflict record failed");
                return;
            }
        };

        info!(
            agent_id,
            existing_ip, new_ip, "agent connection conflict detected"
        );

        // Fan out under the owning organization, when the agent has one.
        match self.storage.get_agent_by_agent_id(agent_id).await {
            Ok(Some(agent)) => {
                if let Some(org_id) = agent.org_id {
                    self.hub.publish(&org_id.to_string(), conflict).await;
                }
            }
            Ok(None) => {}
            Err(e) => error!(agent_id, error = %e, "conflict org lookup failed"),
        }
    }
}
