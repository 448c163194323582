//! Schema migration runner
//!
//! Applies pending scripts from a [`MigrationSource`] in name order, one
//! transaction per script, and records each under a shared batch number so
//! the most recent batch can be rolled back as a unit.

pub mod source;
pub mod store;

use crate::connection::ManageConnection;
use crate::connection::pool::{ConnectionPool, PoolGuard};
use crate::core::{DbError, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{error, info};

pub use source::{MigrationScript, MigrationSource};
pub use store::{MigrationRecord, MigrationStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub executed: Vec<String>,
    pub pending: Vec<String>,
    pub total_executed: usize,
    pub total_pending: usize,
}

impl MigrationStatus {
    fn new(scripts: &[MigrationScript], records: &[MigrationRecord]) -> Self {
        let executed: Vec<String> = records.iter().map(|r| r.migration.clone()).collect();
        let applied: HashSet<&str> = executed.iter().map(String::as_str).collect();
        let pending: Vec<String> = scripts
            .iter()
            .filter(|script| !applied.contains(script.name.as_str()))
            .map(|script| script.name.clone())
            .collect();

        Self {
            total_executed: executed.len(),
            total_pending: pending.len(),
            executed,
            pending,
        }
    }
}

/// A script that failed, with the underlying error text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFailure {
    pub migration: String,
    pub error: String,
}

impl MigrationFailure {
    fn new(migration: &str, err: DbError) -> Self {
        let error = match err {
            DbError::MigrationFailed { error, .. } => error,
            other => other.to_string(),
        };
        Self {
            migration: migration.to_string(),
            error,
        }
    }
}

impl From<MigrationFailure> for DbError {
    fn from(failure: MigrationFailure) -> Self {
        DbError::MigrationFailed {
            migration: failure.migration,
            error: failure.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub success: bool,
    pub executed: Vec<String>,
    pub errors: Vec<MigrationFailure>,
    /// Batch the executed migrations were recorded under
    pub batch: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub rolledback: Vec<String>,
    pub errors: Vec<MigrationFailure>,
    pub batch: Option<i64>,
}

/// Runs migrations over connections borrowed from a pool
///
/// Runs and rollbacks are serialized: within the process by an async lock,
/// across processes by [`MigrationStore::lock_history`].
pub struct Migrator<M>
where
    M: ManageConnection,
    M::Connection: MigrationStore,
{
    pool: ConnectionPool<M>,
    source: MigrationSource,
    writer: Mutex<()>,
}

impl<M> Migrator<M>
where
    M: ManageConnection,
    M::Connection: MigrationStore,
{
    pub fn new(pool: ConnectionPool<M>, source: MigrationSource) -> Self {
        Self {
            pool,
            source,
            writer: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &MigrationSource {
        &self.source
    }

    pub fn pool(&self) -> &ConnectionPool<M> {
        &self.pool
    }

    /// Executed migrations from the history, pending ones from the directory
    pub async fn status(&self) -> Result<MigrationStatus> {
        let scripts = self.source.discover()?;

        let mut lease = self.pool.acquire().await?;
        let ensured = lease.ensure_history().await;
        lease.check(ensured)?;
        let records = lease.executed().await;
        let records = lease.check(records)?;
        lease.release().await?;

        Ok(MigrationStatus::new(&scripts, &records))
    }

    /// Apply every pending migration as one new batch
    ///
    /// Stops at the first failing script. Migrations applied earlier in the
    /// same run stay recorded; undoing them takes an explicit `rollback`.
    pub async fn run(&self) -> Result<MigrationOutcome> {
        let _writer = self.writer.lock().await;
        let scripts = self.source.discover()?;

        let mut lease = self.pool.acquire().await?;
        let locked = lease.lock_history().await;
        lease.check(locked)?;
        let outcome = self.apply_pending(&mut lease, &scripts).await;
        let unlocked = lease.unlock_history().await;
        if unlocked.is_err() {
            // A session-level lock must not outlive this run in an idle connection.
            lease.mark_unhealthy();
        }
        lease.release().await?;

        let outcome = outcome?;
        unlocked?;
        Ok(outcome)
    }

    /// Revert the most recent batch in reverse apply order
    ///
    /// With no batch recorded this is a successful no-op.
    pub async fn rollback(&self) -> Result<RollbackOutcome> {
        let _writer = self.writer.lock().await;
        let scripts = self.source.discover()?;

        let mut lease = self.pool.acquire().await?;
        let locked = lease.lock_history().await;
        lease.check(locked)?;
        let outcome = self.revert_last_batch(&mut lease, &scripts).await;
        let unlocked = lease.unlock_history().await;
        if unlocked.is_err() {
            lease.mark_unhealthy();
        }
        lease.release().await?;

        let outcome = outcome?;
        unlocked?;
        Ok(outcome)
    }

    async fn apply_pending(
        &self,
        lease: &mut PoolGuard<M>,
        scripts: &[MigrationScript],
    ) -> Result<MigrationOutcome> {
        let ensured = lease.ensure_history().await;
        lease.check(ensured)?;
        let records = lease.executed().await;
        let records = lease.check(records)?;

        let applied: HashSet<&str> = records.iter().map(|r| r.migration.as_str()).collect();
        let pending: Vec<&MigrationScript> = scripts
            .iter()
            .filter(|script| !applied.contains(script.name.as_str()))
            .collect();

        if pending.is_empty() {
            info!("Nothing to migrate");
            return Ok(MigrationOutcome {
                success: true,
                executed: Vec::new(),
                errors: Vec::new(),
                batch: None,
            });
        }

        let batch = records.iter().map(|r| r.batch).max().unwrap_or(0) + 1;
        let mut executed = Vec::new();
        let mut errors = Vec::new();

        for script in pending {
            let result = match script.up_sql().await {
                Ok(sql) => {
                    let applied = lease.apply(&script.name, &sql, batch).await;
                    lease
                        .check(applied)
                        .map_err(|err| DbError::migration_failed(&script.name, err))
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => {
                    info!(migration = %script.name, batch, "Migration applied");
                    executed.push(script.name.clone());
                }
                Err(err) => {
                    error!(migration = %script.name, batch, error = %err, "Migration failed, stopping run");
                    errors.push(MigrationFailure::new(&script.name, err));
                    break;
                }
            }
        }

        Ok(MigrationOutcome {
            success: errors.is_empty(),
            executed,
            errors,
            batch: Some(batch),
        })
    }

    async fn revert_last_batch(
        &self,
        lease: &mut PoolGuard<M>,
        scripts: &[MigrationScript],
    ) -> Result<RollbackOutcome> {
        let ensured = lease.ensure_history().await;
        lease.check(ensured)?;
        let records = lease.executed().await;
        let records = lease.check(records)?;

        let Some(batch) = records.iter().map(|r| r.batch).max() else {
            info!("Nothing to roll back");
            return Ok(RollbackOutcome {
                success: true,
                rolledback: Vec::new(),
                errors: Vec::new(),
                batch: None,
            });
        };

        let mut names: Vec<&str> = records
            .iter()
            .filter(|r| r.batch == batch)
            .map(|r| r.migration.as_str())
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));

        let by_name: HashMap<&str, &MigrationScript> =
            scripts.iter().map(|script| (script.name.as_str(), script)).collect();

        let mut rolledback = Vec::new();
        let mut errors = Vec::new();

        for name in names {
            let result = match by_name.get(name) {
                Some(script) => match script.down_sql().await {
                    Ok(sql) => {
                        let reverted = lease.revert(name, &sql).await;
                        lease
                            .check(reverted)
                            .map_err(|err| DbError::migration_failed(name, err))
                    }
                    Err(err) => Err(err),
                },
                None => Err(DbError::migration_failed(
                    name,
                    "script is no longer present in the migrations directory",
                )),
            };

            match result {
                Ok(()) => {
                    info!(migration = %name, batch, "Migration rolled back");
                    rolledback.push(name.to_string());
                }
                Err(err) => {
                    error!(migration = %name, batch, error = %err, "Rollback failed, stopping");
                    errors.push(MigrationFailure::new(name, err));
                    break;
                }
            }
        }

        Ok(RollbackOutcome {
            success: errors.is_empty(),
            rolledback,
            errors,
            batch: Some(batch),
        })
    }
}
