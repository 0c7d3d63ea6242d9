//! Incident row operations.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};

use opsd_core::model::{Incident, SuggestedAction};

use super::{Storage, StorageError};

const INCIDENT_COLUMNS: &str = "id, agent_id, type, source, raw_error, context, ai_analysis, \
     is_critical, suggested_action, status, created_at";

/// Input for incident creation, produced by the events consumer.
#[derive(Debug, Clone)]
pub struct NewIncident {
    /// Reporting agent.
    pub agent_id: String,
    /// Alert type.
    pub kind: String,
    /// Originating source.
    pub source: String,
    /// Sanitized raw error text.
    pub raw_error: String,
    /// Alert details.
    pub context: serde_json::Value,
}

/// Fields the analysis pipeline writes back onto an incident.
#[derive(Debug, Clone)]
pub struct IncidentUpdate {
    /// Analysis text.
    pub ai_analysis: String,
    /// Criticality verdict.
    pub is_critical: bool,
    /// Suggested remediation, when any.
    pub suggested_action: Option<SuggestedAction>,
    /// New lifecycle status.
    pub status: String,
}

impl FromRow<'_, PgRow> for Incident {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        let suggested_action = row
            .try_get::<Option<sqlx::types::Json<SuggestedAction>>, _>("suggested_action")?
            .map(|json| json.0);

        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            kind: row.try_get("type")?,
            source: row.try_get("source")?,
            raw_error: row.try_get("raw_error")?,
            context: row
                .try_get::<Option<serde_json::Value>, _>("context")?
                .unwrap_or_else(|| serde_json::json!({})),
            ai_analysis: row
                .try_get::<Option<String>, _>("ai_analysis")?
                .unwrap_or_default(),
            is_critical: row.try_get("is_critical")?,
            suggested_action,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Storage {
    /// Persist a new incident with status `new`. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn create_incident(&self, input: &NewIncident) -> Result<Incident, StorageError> {
        let query = format!(
            r"
            INSERT INTO incidents (agent_id, type, source, raw_error, context, ai_analysis, status)
            VALUES ($1, $2, $3, $4, $5, '', 'new')
            RETURNING {INCIDENT_COLUMNS}
            "
        );

        Ok(sqlx::query_as::<_, Incident>(&query)
            .bind(&input.agent_id)
            .bind(&input.kind)
            .bind(&input.source)
            .bind(&input.raw_error)
            .bind(&input.context)
            .fetch_one(self.pool())
            .await?)
    }

    /// Look up one incident.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_incident(&self, id: i64) -> Result<Option<Incident>, StorageError> {
        let query = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1");
        Ok(sqlx::query_as::<_, Incident>(&query)
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Recent incidents for an agent, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn list_incidents(
        &self,
        agent_id: &str,
        limit: i64,
    ) -> Result<Vec<Incident>, StorageError> {
        let query = format!(
            r"
            SELECT {INCIDENT_COLUMNS} FROM incidents
            WHERE agent_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "
        );
        Ok(sqlx::query_as::<_, Incident>(&query)
            .bind(agent_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?)
    }

    /// Apply analysis results to an incident.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the incident does not
    /// exist, [`StorageError::Database`] on driver failure.
    pub async fn update_incident(
        &self,
        id: i64,
        update: &IncidentUpdate,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE incidents
            SET ai_analysis = $1, is_critical = $2, suggested_action = $3, status = $4
            WHERE id = $5
            ",
        )
        .bind(&update.ai_analysis)
        .bind(update.is_critical)
        .bind(update.suggested_action.clone().map(sqlx::types::Json))
        .bind(&update.status)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
