//! Persistence gateway.
//!
//! Typed operations over organizations, users, bootstrap tokens, agents,
//! credentials, connections, conflicts, incidents and inventory snapshots.
//! Row absence surfaces as `Option::None` (lookups) or
//! [`StorageError::NotFound`] (targeted mutations); unique violations map
//! to [`StorageError::Conflict`] or a more specific variant.

mod agents;
mod connections;
mod conflicts;
mod credentials;
mod incidents;
mod inventory;
mod orgs;
mod tokens;

pub use agents::AgentUpsert;
pub use connections::NewConnection;
pub use conflicts::NewConflict;
pub use credentials::NewCredential;
pub use incidents::{IncidentUpdate, NewIncident};

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

use opsd_core::error::TokenError;

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// Connection attempts before startup gives up.
const CONNECT_ATTEMPTS: u32 = 10;

/// Delay between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Gateway failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The targeted row does not exist.
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint rejected the write.
    #[error("conflict")]
    Conflict,

    /// The referenced organization does not exist.
    #[error("organization not found")]
    OrgNotFound,

    /// The organization slug is already taken.
    #[error("organization slug already taken")]
    SlugTaken,

    /// Bootstrap-token validation verdict.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Hashing or serialization failure inside a gateway operation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other driver failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The persistence gateway. Cheap to clone; all clones share one pool.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: PgPool,
}

impl Storage {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to Postgres, retrying for slow database startup.
    ///
    /// # Errors
    ///
    /// Returns the last connection error after all attempts fail.
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        for attempt in 1..CONNECT_ATTEMPTS {
            match pool_options().connect(dsn).await {
                Ok(pool) => {
                    info!("connected to database");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "database connection attempt failed");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }

        // Final attempt surfaces the error.
        let pool = pool_options().connect(dsn).await?;
        info!("connected to database");
        Ok(Self { pool })
    }

    /// The underlying pool, for collaborators that need raw access.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connectivity probe.
    ///
    /// # Errors
    ///
    /// Returns the driver error when the database is unreachable.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(5))
}

/// Whether a driver error is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

/// Decode a nullable JSONB string-array column, defaulting to empty.
pub(crate) fn json_string_array(row: &PgRow, column: &str) -> Result<Vec<String>, sqlx::Error> {
    let value: Option<sqlx::types::Json<Vec<String>>> = row.try_get(column)?;
    Ok(value.map(|json| json.0).unwrap_or_default())
}

/// Decode a text column into a domain enum, reporting decode failures
/// against the column.
pub(crate) fn parse_column<T>(row: &PgRow, column: &'static str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: T::Err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.to_string().into(),
    })
}
