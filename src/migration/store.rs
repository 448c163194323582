use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Row of the migration history table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub migration: String,
    pub batch: i64,
    pub applied_at: DateTime<Utc>,
}

/// Migration history operations, implemented by a pooled connection type
#[async_trait]
pub trait MigrationStore: Send {
    /// Block until this connection is the only migration writer
    async fn lock_history(&mut self) -> Result<()>;

    async fn unlock_history(&mut self) -> Result<()>;

    /// Create the history table if it does not exist
    async fn ensure_history(&mut self) -> Result<()>;

    /// Applied migrations ordered by batch, then name
    async fn executed(&mut self) -> Result<Vec<MigrationRecord>>;

    /// Run `sql` and record `name` under `batch` in a single transaction
    async fn apply(&mut self, name: &str, sql: &str, batch: i64) -> Result<()>;

    /// Run the rollback `sql` and delete the record for `name` in a single transaction
    async fn revert(&mut self, name: &str, sql: &str) -> Result<()>;
}
