//! Agent connection tracking.
//!
//! The application keeps at most one row per agent with a null
//! `disconnected_at`; a connect race may briefly create a second, which
//! the conflict service detects.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use opsd_core::model::AgentConnection;

use super::{Storage, StorageError};

const CONNECTION_COLUMNS: &str = "id, agent_id, client_id, remote_ip::text, hostname, \
     connected_at, disconnected_at, disconnect_reason";

/// Input for connection recording.
#[derive(Debug, Clone)]
pub struct NewConnection<'a> {
    /// Owning agent.
    pub agent_id: &'a str,
    /// Bus client id, when reported.
    pub client_id: &'a str,
    /// Remote IP of the connection.
    pub remote_ip: &'a str,
    /// Hostname reported at connect.
    pub hostname: &'a str,
}

impl FromRow<'_, PgRow> for AgentConnection {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            client_id: row.try_get("client_id")?,
            remote_ip: row.try_get("remote_ip")?,
            hostname: row.try_get("hostname")?,
            connected_at: row.try_get("connected_at")?,
            disconnected_at: row.try_get("disconnected_at")?,
            disconnect_reason: row.try_get("disconnect_reason")?,
        })
    }
}

impl Storage {
    /// Record a newly observed connection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn record_agent_connection(
        &self,
        input: &NewConnection<'_>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO agent_connections (id, agent_id, client_id, remote_ip, hostname, connected_at)
            VALUES ($1, $2, $3, $4::inet, $5, NOW())
            ",
        )
        .bind(Uuid::new_v4())
        .bind(input.agent_id)
        .bind(Some(input.client_id).filter(|c| !c.is_empty()))
        .bind(input.remote_ip)
        .bind(Some(input.hostname).filter(|h| !h.is_empty()))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The most recent open connection for an agent, when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_active_connection(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentConnection>, StorageError> {
        let query = format!(
            r"
            SELECT {CONNECTION_COLUMNS} FROM agent_connections
            WHERE agent_id = $1 AND disconnected_at IS NULL
            ORDER BY connected_at DESC
            LIMIT 1
            "
        );
        Ok(sqlx::query_as::<_, AgentConnection>(&query)
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Close every open connection row for an agent with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn record_agent_disconnect(
        &self,
        agent_id: &str,
        reason: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r"
            UPDATE agent_connections
            SET disconnected_at = NOW(), disconnect_reason = $2
            WHERE agent_id = $1 AND disconnected_at IS NULL
            ",
        )
        .bind(agent_id)
        .bind(Some(reason).filter(|r| !r.is_empty()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
