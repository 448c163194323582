use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection pool exhausted: no connection became available within {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Connection pool unavailable after {attempts} attempt(s): {reason}")]
    PoolUnavailable { attempts: u32, reason: String },

    #[error("Connection pool is shut down")]
    PoolClosed,

    /// Failed liveness probe. Absorbed by the pool, never returned from `acquire`.
    #[error("Connection {0} failed its liveness probe")]
    ConnectionUnhealthy(u64),

    /// The connection itself failed mid-operation (socket, TLS or protocol)
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Lease for connection {0} was already released")]
    LeaseReleased(u64),

    #[error("Capacity check failed: {0}")]
    CapacityCheckFailed(String),

    #[error("Migration '{migration}' failed: {error}")]
    MigrationFailed { migration: String, error: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn migration_failed(migration: impl Into<String>, error: impl ToString) -> Self {
        Self::MigrationFailed {
            migration: migration.into(),
            error: error.to_string(),
        }
    }

    /// Whether the connection that produced this error must not be reused
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => Self::ConnectionLost(err.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}
