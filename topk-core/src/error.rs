use thiserror::Error;

/// Errors from the Postgres-backed stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("migration failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
    #[error("delta for {user_id}/{day}/{item_id} must be positive, got {delta}")]
    InvalidDelta {
        user_id: String,
        day: chrono::NaiveDate,
        item_id: String,
        delta: i64,
    },
}

impl StoreError {
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

/// Errors from the shared dedup set.
#[derive(Error, Debug)]
pub enum DedupError {
    /// The store could not be reached, the same call may succeed later
    #[error("dedup store unavailable: {0}")]
    Unavailable(common_redis::CustomRedisError),
    /// The store answered with an error it will keep returning, such as a full filter
    #[error("dedup store rejected the insert: {0}")]
    Rejected(common_redis::CustomRedisError),
}

impl DedupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DedupError::Unavailable(_))
    }
}

impl From<common_redis::CustomRedisError> for DedupError {
    fn from(err: common_redis::CustomRedisError) -> Self {
        if err.is_transient() {
            DedupError::Unavailable(err)
        } else {
            DedupError::Rejected(err)
        }
    }
}
