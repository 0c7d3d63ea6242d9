//! Inventory snapshot operations.

use super::{Storage, StorageError};

impl Storage {
    /// Insert an inventory snapshot unless an identical one already exists.
    ///
    /// Idempotent on `(agent_id, hash)`: re-delivered or unchanged
    /// snapshots insert nothing. Returns whether a row was written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn insert_inventory_snapshot(
        &self,
        agent_id: &str,
        hash: &str,
        payload: &serde_json::Value,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r"
            INSERT INTO inventory_snapshots (agent_id, hash, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (agent_id, hash) DO NOTHING
            ",
        )
        .bind(agent_id)
        .bind(hash)
        .bind(payload)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
