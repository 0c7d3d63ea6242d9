//! Agent conflict rows.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use opsd_core::model::{AgentConflict, ConflictResolution};

use super::{parse_column, Storage, StorageError};

const CONFLICT_COLUMNS: &str = "id, agent_id, existing_ip::text, new_ip::text, existing_hostname, \
     new_hostname, resolution, resolved_by, created_at, resolved_at";

/// Input for conflict recording.
#[derive(Debug, Clone)]
pub struct NewConflict<'a> {
    /// Conflicted agent.
    pub agent_id: &'a str,
    /// Remote IP of the connection already open.
    pub existing_ip: &'a str,
    /// Remote IP of the newly observed connection.
    pub new_ip: &'a str,
    /// Hostname of the connection already open.
    pub existing_hostname: &'a str,
    /// Hostname of the newly observed connection.
    pub new_hostname: &'a str,
}

impl FromRow<'_, PgRow> for AgentConflict {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            existing_ip: row.try_get("existing_ip")?,
            new_ip: row.try_get("new_ip")?,
            existing_hostname: row.try_get("existing_hostname")?,
            new_hostname: row.try_get("new_hostname")?,
            resolution: parse_column::<ConflictResolution>(row, "resolution")?,
            resolved_by: row.try_get("resolved_by")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

impl Storage {
    /// Record a pending conflict. Returns the stored row for fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn record_agent_conflict(
        &self,
        input: &NewConflict<'_>,
    ) -> Result<AgentConflict, StorageError> {
        let query = format!(
            r"
            INSERT INTO agent_conflicts (
                id, agent_id, existing_ip, new_ip, existing_hostname, new_hostname,
                resolution, created_at
            )
            VALUES ($1, $2, $3::inet, $4::inet, $5, $6, 'pending', NOW())
            RETURNING {CONFLICT_COLUMNS}
            "
        );

        Ok(sqlx::query_as::<_, AgentConflict>(&query)
            .bind(Uuid::new_v4())
            .bind(input.agent_id)
            .bind(input.existing_ip)
            .bind(input.new_ip)
            .bind(Some(input.existing_hostname).filter(|h| !h.is_empty()))
            .bind(Some(input.new_hostname).filter(|h| !h.is_empty()))
            .fetch_one(self.pool())
            .await?)
    }

    /// Unresolved conflicts for an organization, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn list_unresolved_conflicts(
        &self,
        org_id: Uuid,
    ) -> Result<Vec<AgentConflict>, StorageError> {
        let query = r"
            SELECT c.id, c.agent_id, c.existing_ip::text, c.new_ip::text,
                   c.existing_hostname, c.new_hostname, c.resolution, c.resolved_by,
                   c.created_at, c.resolved_at
            FROM agent_conflicts c
            JOIN agents a ON a.agent_id = c.agent_id
            WHERE a.org_id = $1 AND c.resolved_at IS NULL
            ORDER BY c.created_at DESC
            ";

        Ok(sqlx::query_as::<_, AgentConflict>(query)
            .bind(org_id)
            .fetch_all(self.pool())
            .await?)
    }

    /// Look up one conflict.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_conflict(&self, id: Uuid) -> Result<Option<AgentConflict>, StorageError> {
        let query = format!("SELECT {CONFLICT_COLUMNS} FROM agent_conflicts WHERE id = $1");
        Ok(sqlx::query_as::<_, AgentConflict>(&query)
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Record an operator's resolution of a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the conflict does not
    /// exist, [`StorageError::Database`] on driver failure.
    pub async fn resolve_conflict(
        &self,
        id: Uuid,
        resolution: ConflictResolution,
        resolved_by: Option<Uuid>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE agent_conflicts
            SET resolution = $2, resolved_by = $3, resolved_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(resolution.as_str())
        .bind(resolved_by)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
