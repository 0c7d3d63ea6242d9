//! Agent credential operations.
//!
//! At most one non-revoked credential per agent is pinned; the partial
//! unique index behind `(agent_id, public_key)` and the pinned lookup
//! enforce identity continuity.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use opsd_core::model::AgentCredential;

use super::{is_unique_violation, Storage, StorageError};

const CREDENTIAL_COLUMNS: &str = "id, agent_id, public_key, is_pinned, fingerprint_at_registration, \
     registered_from_ip::text, registered_hostname, jwt_expires_at, created_at, revoked_at";

/// Input for credential creation.
#[derive(Debug, Clone)]
pub struct NewCredential<'a> {
    /// Owning agent.
    pub agent_id: &'a str,
    /// User NKey public key.
    pub public_key: &'a str,
    /// Pin this key as the agent's identity anchor. Only the first key
    /// for an agent is pinned.
    pub is_pinned: bool,
    /// Hardware fingerprint at registration.
    pub fingerprint: &'a str,
    /// Remote IP at registration.
    pub remote_ip: &'a str,
    /// Hostname at registration.
    pub hostname: &'a str,
    /// Expiry of the issued JWT.
    pub expires_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for AgentCredential {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            public_key: row.try_get("public_key")?,
            is_pinned: row.try_get("is_pinned")?,
            fingerprint_at_registration: row.try_get("fingerprint_at_registration")?,
            registered_from_ip: row.try_get("registered_from_ip")?,
            registered_hostname: row.try_get("registered_hostname")?,
            expires_at: row.try_get("jwt_expires_at")?,
            created_at: row.try_get("created_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    }
}

impl Storage {
    /// Record a credential issued to an agent.
    ///
    /// `(agent_id, public_key)` is unique; re-enrolling with the same key
    /// refreshes the expiry and registration context instead of failing.
    /// The pin flag of an existing row is never rewritten - re-enrollment
    /// computes it against the already-pinned key and must not unpin it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] on any other uniqueness
    /// violation, [`StorageError::Database`] on driver failure.
    pub async fn create_agent_credential(
        &self,
        input: &NewCredential<'_>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO agent_credentials (
                agent_id, public_key, is_pinned, fingerprint_at_registration,
                registered_from_ip, registered_hostname, jwt_expires_at
            )
            VALUES ($1, $2, $3, $4, $5::inet, $6, $7)
            ON CONFLICT (agent_id, public_key) DO UPDATE SET
                fingerprint_at_registration = EXCLUDED.fingerprint_at_registration,
                registered_from_ip = EXCLUDED.registered_from_ip,
                registered_hostname = EXCLUDED.registered_hostname,
                jwt_expires_at = EXCLUDED.jwt_expires_at
            ",
        )
        .bind(input.agent_id)
        .bind(input.public_key)
        .bind(input.is_pinned)
        .bind(Some(input.fingerprint).filter(|f| !f.is_empty()))
        .bind(Some(input.remote_ip).filter(|ip| !ip.is_empty()))
        .bind(Some(input.hostname).filter(|h| !h.is_empty()))
        .bind(input.expires_at)
        .execute(self.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Conflict
            } else {
                StorageError::Database(e)
            }
        })?;
        Ok(())
    }

    /// The agent's pinned, non-revoked public key, when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_pinned_public_key(
        &self,
        agent_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT public_key FROM agent_credentials
            WHERE agent_id = $1 AND is_pinned = true AND revoked_at IS NULL
            LIMIT 1
            ",
        )
        .bind(agent_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| r.try_get("public_key").map_err(StorageError::from))
            .transpose()
    }

    /// All credentials issued to an agent, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn list_agent_credentials(
        &self,
        agent_id: &str,
    ) -> Result<Vec<AgentCredential>, StorageError> {
        let query = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM agent_credentials \
             WHERE agent_id = $1 ORDER BY created_at DESC"
        );
        Ok(sqlx::query_as::<_, AgentCredential>(&query)
            .bind(agent_id)
            .fetch_all(self.pool())
            .await?)
    }

    /// Revoke every active credential of an agent, ahead of a key
    /// rotation. Returns how many were revoked.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn revoke_active_credentials(&self, agent_id: &str) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r"
            UPDATE agent_credentials SET revoked_at = NOW()
            WHERE agent_id = $1 AND revoked_at IS NULL
            ",
        )
        .bind(agent_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
