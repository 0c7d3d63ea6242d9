//! Agent row operations.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use opsd_core::model::{Agent, AgentStatus};

use super::{json_string_array, parse_column, Storage, StorageError};

const AGENT_COLUMNS: &str = "id, agent_id, org_id, name, hostname, status, tags, \
     hardware_fingerprint, enrolled_via, enrolled_at, enrolled_ip::text, \
     last_seen_at, meta";

/// Input for the merging agent upsert.
///
/// The merge is deliberate: partial enrollment retries must not erase
/// state. Non-empty incoming name/fingerprint and non-null tags replace
/// the stored values; `None` preserves them; `org_id` is only ever filled
/// in, never cleared.
#[derive(Debug, Clone)]
pub struct AgentUpsert {
    /// 12-char lowercase hex identifier.
    pub agent_id: String,
    /// Owning organization, when known.
    pub org_id: Option<Uuid>,
    /// Display name; empty preserves the stored name.
    pub name: String,
    /// Reported hostname; always replaces.
    pub hostname: String,
    /// Presence state; always replaces.
    pub status: AgentStatus,
    /// Tags; `None` preserves stored tags.
    pub tags: Option<Vec<String>>,
    /// Hardware fingerprint; empty preserves.
    pub hardware_fingerprint: Option<String>,
    /// Enrolling bootstrap token.
    pub enrolled_via: Option<Uuid>,
    /// Enrollment time.
    pub enrolled_at: Option<DateTime<Utc>>,
    /// Enrollment remote IP.
    pub enrolled_ip: Option<String>,
    /// Presence evidence; always replaces.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Opaque metadata; `None` preserves.
    pub meta: Option<serde_json::Value>,
}

impl AgentUpsert {
    /// A minimal upsert for an agent first observed through the event
    /// stream, before enrollment.
    #[must_use]
    pub fn observed(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            org_id: None,
            name: String::new(),
            hostname: "unknown".to_string(),
            status: AgentStatus::Online,
            tags: None,
            hardware_fingerprint: None,
            enrolled_via: None,
            enrolled_at: None,
            enrolled_ip: None,
            last_seen_at: Some(Utc::now()),
            meta: None,
        }
    }
}

impl FromRow<'_, PgRow> for Agent {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            agent_id: row.try_get("agent_id")?,
            org_id: row.try_get("org_id")?,
            name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            hostname: row.try_get("hostname")?,
            status: parse_column::<AgentStatus>(row, "status")?,
            tags: json_string_array(row, "tags")?,
            hardware_fingerprint: row.try_get("hardware_fingerprint")?,
            enrolled_via: row.try_get("enrolled_via")?,
            enrolled_at: row.try_get("enrolled_at")?,
            enrolled_ip: row.try_get("enrolled_ip")?,
            last_seen_at: row.try_get("last_seen_at")?,
            meta: row
                .try_get::<Option<serde_json::Value>, _>("meta")?
                .unwrap_or_else(|| serde_json::json!({})),
        })
    }
}

impl Storage {
    /// Insert or merge an agent row keyed by `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn upsert_agent(&self, input: &AgentUpsert) -> Result<Agent, StorageError> {
        let query = format!(
            r"
            INSERT INTO agents (
                id, agent_id, org_id, name, hostname, status, tags,
                hardware_fingerprint, enrolled_via, enrolled_at, enrolled_ip,
                last_seen_at, meta
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, COALESCE($7, '[]'::jsonb),
                $8, $9, $10, $11::inet, $12, COALESCE($13, '{{}}'::jsonb)
            )
            ON CONFLICT (agent_id) DO UPDATE SET
                org_id = COALESCE(EXCLUDED.org_id, agents.org_id),
                name = COALESCE(NULLIF(EXCLUDED.name, ''), agents.name),
                hostname = EXCLUDED.hostname,
                status = EXCLUDED.status,
                last_seen_at = EXCLUDED.last_seen_at,
                tags = COALESCE($7, agents.tags),
                hardware_fingerprint =
                    COALESCE(NULLIF(EXCLUDED.hardware_fingerprint, ''), agents.hardware_fingerprint),
                enrolled_via = COALESCE(EXCLUDED.enrolled_via, agents.enrolled_via),
                enrolled_at = COALESCE(EXCLUDED.enrolled_at, agents.enrolled_at),
                enrolled_ip = COALESCE(EXCLUDED.enrolled_ip, agents.enrolled_ip),
                meta = COALESCE($13, agents.meta)
            RETURNING {AGENT_COLUMNS}
            "
        );

        let agent = sqlx::query_as::<_, Agent>(&query)
            .bind(Uuid::new_v4())
            .bind(&input.agent_id)
            .bind(input.org_id)
            .bind(&input.name)
            .bind(&input.hostname)
            .bind(input.status.to_string())
            .bind(input.tags.clone().map(sqlx::types::Json))
            .bind(input.hardware_fingerprint.as_deref().filter(|f| !f.is_empty()))
            .bind(input.enrolled_via)
            .bind(input.enrolled_at)
            .bind(input.enrolled_ip.as_deref().filter(|ip| !ip.is_empty()))
            .bind(input.last_seen_at)
            .bind(input.meta.clone())
            .fetch_one(self.pool())
            .await?;

        Ok(agent)
    }

    /// Look up an agent by row id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, StorageError> {
        let query = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = $1");
        Ok(sqlx::query_as::<_, Agent>(&query)
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Look up an agent by its 12-hex identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_agent_by_agent_id(
        &self,
        agent_id: &str,
    ) -> Result<Option<Agent>, StorageError> {
        let query = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1");
        Ok(sqlx::query_as::<_, Agent>(&query)
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// All agent identifiers, for the periodic reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn list_agent_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT agent_id FROM agents ORDER BY agent_id")
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| row.try_get("agent_id").map_err(StorageError::from))
            .collect()
    }

    /// Set an agent's status, refreshing `last_seen_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE agents SET status = $1, last_seen_at = NOW() WHERE agent_id = $2")
            .bind(status.to_string())
            .bind(agent_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Force an agent offline, recording when presence evidence last
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn mark_agent_offline(
        &self,
        agent_id: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE agents SET status = 'offline', last_seen_at = $2 WHERE agent_id = $1")
            .bind(agent_id)
            .bind(last_seen_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Force offline every online agent whose `last_seen_at` is older than
    /// the threshold. Returns how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn mark_stale_agents_offline(
        &self,
        threshold: std::time::Duration,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r"
            UPDATE agents SET status = 'offline'
            WHERE status = 'online'
              AND last_seen_at < NOW() - make_interval(secs => $1)
            ",
        )
        .bind(threshold.as_secs_f64())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Refresh an agent's metadata and hostname from an inventory-bearing
    /// heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn update_agent_meta_and_hostname(
        &self,
        agent_id: &str,
        meta: serde_json::Value,
        hostname: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE agents SET meta = $1, hostname = $2, last_seen_at = NOW() WHERE agent_id = $3",
        )
        .bind(meta)
        .bind(hostname)
        .bind(agent_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
