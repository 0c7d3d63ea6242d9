//! Bootstrap-token operations.
//!
//! The secret itself never touches a column: rows hold the bcrypt hash
//! plus the literal first 12 characters for indexed candidate lookup.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use opsd_core::error::TokenError;
use opsd_core::identity::bootstrap::{generate_token, index_prefix, validate_token};
use opsd_core::model::{BootstrapToken, CreateBootstrapTokenInput};

use super::{json_string_array, Storage, StorageError};

const TOKEN_COLUMNS: &str = "id, org_id, token_prefix, token_hash, description, tags, \
     allowed_cidrs, expires_at, max_uses, use_count, created_by, created_at, \
     last_used_at, revoked_at";

impl FromRow<'_, PgRow> for BootstrapToken {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            token_prefix: row.try_get("token_prefix")?,
            token_hash: row.try_get("token_hash")?,
            description: row.try_get("description")?,
            tags: json_string_array(row, "tags")?,
            allowed_cidrs: json_string_array(row, "allowed_cidrs")?,
            expires_at: row.try_get("expires_at")?,
            max_uses: row.try_get("max_uses")?,
            use_count: row.try_get("use_count")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
            revoked_at: row.try_get("revoked_at")?,
        })
    }
}

impl Storage {
    /// Create a bootstrap token. The returned secret is the only copy
    /// that will ever exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn create_bootstrap_token(
        &self,
        org_id: Uuid,
        created_by: Option<Uuid>,
        input: &CreateBootstrapTokenInput,
    ) -> Result<(BootstrapToken, String), StorageError> {
        let generated =
            generate_token().map_err(|e| StorageError::Internal(format!("hash token: {e}")))?;

        let allowed_cidrs = if input.allowed_cidrs.is_empty() {
            None
        } else {
            Some(sqlx::types::Json(input.allowed_cidrs.clone()))
        };

        let query = format!(
            r"
            INSERT INTO bootstrap_tokens (
                org_id, token_hash, token_prefix, description, tags, allowed_cidrs,
                expires_at, max_uses, use_count, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, COALESCE($5, '[]'::jsonb), $6, $7, $8, 0, $9, NOW())
            RETURNING {TOKEN_COLUMNS}
            "
        );

        let token = sqlx::query_as::<_, BootstrapToken>(&query)
            .bind(org_id)
            .bind(&generated.hash)
            .bind(&generated.prefix)
            .bind(input.description.as_deref().filter(|d| !d.is_empty()))
            .bind(Some(sqlx::types::Json(input.tags.clone())))
            .bind(allowed_cidrs)
            .bind(input.expires_at)
            .bind(input.max_uses)
            .bind(created_by)
            .fetch_one(self.pool())
            .await?;

        Ok((token, generated.token))
    }

    /// All tokens of an organization, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn list_bootstrap_tokens(
        &self,
        org_id: Uuid,
    ) -> Result<Vec<BootstrapToken>, StorageError> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM bootstrap_tokens WHERE org_id = $1 ORDER BY created_at DESC"
        );
        Ok(sqlx::query_as::<_, BootstrapToken>(&query)
            .bind(org_id)
            .fetch_all(self.pool())
            .await?)
    }

    /// Look up one token row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_bootstrap_token(
        &self,
        id: Uuid,
    ) -> Result<Option<BootstrapToken>, StorageError> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM bootstrap_tokens WHERE id = $1");
        Ok(sqlx::query_as::<_, BootstrapToken>(&query)
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    /// Validate a presented secret against the stored rows.
    ///
    /// Candidates are selected by the indexed 12-char prefix; the bcrypt
    /// hash decides which candidate, if any, matches. The matching row is
    /// then checked for revocation, expiry, usage ceiling and the CIDR
    /// allow-list.
    ///
    /// # Errors
    ///
    /// Returns the applicable [`TokenError`] verdict, or
    /// [`StorageError::Database`] on driver failure.
    pub async fn validate_bootstrap_token(
        &self,
        token: &str,
        remote_ip: &str,
    ) -> Result<BootstrapToken, StorageError> {
        let Some(prefix) = index_prefix(token) else {
            return Err(TokenError::NotFound.into());
        };

        let query = format!("SELECT {TOKEN_COLUMNS} FROM bootstrap_tokens WHERE token_prefix = $1");
        let candidates = sqlx::query_as::<_, BootstrapToken>(&query)
            .bind(prefix)
            .fetch_all(self.pool())
            .await?;

        let now = Utc::now();
        for candidate in candidates {
            match validate_token(token, &candidate, remote_ip, now) {
                Ok(()) => return Ok(candidate),
                // Wrong secret for this candidate; try the next one.
                Err(TokenError::NotFound) => {}
                Err(verdict) => return Err(verdict.into()),
            }
        }

        Err(TokenError::NotFound.into())
    }

    /// Record a successful use of a token.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn increment_bootstrap_token_usage(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query(
            r"
            UPDATE bootstrap_tokens
            SET use_count = use_count + 1, last_used_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Revoke a token.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the token does not exist,
    /// [`StorageError::Database`] on driver failure.
    pub async fn revoke_bootstrap_token(&self, id: Uuid) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE bootstrap_tokens SET revoked_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
