//! Organization and user operations.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use opsd_core::model::{CreateOrganizationInput, Organization, User};

use super::{is_unique_violation, Storage, StorageError};

impl FromRow<'_, PgRow> for Organization {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl FromRow<'_, PgRow> for User {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Storage {
    /// Create an organization.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SlugTaken`] when the slug is in use,
    /// [`StorageError::Database`] on driver failure.
    pub async fn create_organization(
        &self,
        input: &CreateOrganizationInput,
    ) -> Result<Organization, StorageError> {
        sqlx::query_as::<_, Organization>(
            r"
            INSERT INTO organizations (name, slug)
            VALUES ($1, $2)
            RETURNING id, name, slug, created_at
            ",
        )
        .bind(&input.name)
        .bind(&input.slug)
        .fetch_one(self.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::SlugTaken
            } else {
                StorageError::Database(e)
            }
        })
    }

    /// Look up an organization by id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OrgNotFound`] when absent,
    /// [`StorageError::Database`] on driver failure.
    pub async fn get_organization(&self, id: Uuid) -> Result<Organization, StorageError> {
        sqlx::query_as::<_, Organization>(
            "SELECT id, name, slug, created_at FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StorageError::OrgNotFound)
    }

    /// Look up an organization by slug.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OrgNotFound`] when absent,
    /// [`StorageError::Database`] on driver failure.
    pub async fn get_organization_by_slug(&self, slug: &str) -> Result<Organization, StorageError> {
        sqlx::query_as::<_, Organization>(
            "SELECT id, name, slug, created_at FROM organizations WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StorageError::OrgNotFound)
    }

    /// The `default` organization used by single-tenant deployments.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OrgNotFound`] when absent,
    /// [`StorageError::Database`] on driver failure.
    pub async fn get_default_organization(&self) -> Result<Organization, StorageError> {
        self.get_organization_by_slug("default").await
    }

    /// Look up a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>, StorageError> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT id, org_id, email, password_hash, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?)
    }

    /// Look up a user by email.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] on driver failure.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT id, org_id, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(self.pool())
        .await?)
    }
}
