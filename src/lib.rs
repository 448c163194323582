// ============================================================================
// Atelier DB: database resource layer of the tailoring marketplace
// ============================================================================

pub mod admission;
pub mod backend;
pub mod config;
pub mod connection;
pub mod core;
pub mod migration;
pub mod web;

#[cfg(test)]
mod test_support;

pub use admission::{
    Admission, AdmissionConfig, AdmissionController, BusyNotice, CapacityFailurePolicy,
    CapacitySnapshot, SessionContext, SweepReport, UserRole,
};
pub use backend::{PgConnectionManager, PgSessionStore};
pub use config::AppConfig;
pub use connection::{
    ConnectionState, ManageConnection,
    config::PoolConfig,
    pool::{ConnectionPool, HealthReport, PoolGuard, PoolStats},
};
pub use core::{DbError, Result};
pub use migration::{
    MigrationFailure, MigrationOutcome, MigrationSource, MigrationStatus, Migrator,
    RollbackOutcome,
};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

// ============================================================================
// High-level handle
// ============================================================================

/// Pool, admission controller and migrator wired to one PostgreSQL database
///
/// ```no_run
/// use atelier_db::{AppConfig, Database};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let config = AppConfig::from_env()?;
/// let db = Database::connect(&config).await?;
///
/// let status = db.migrator().status().await?;
/// println!("{} pending migration(s)", status.total_pending);
///
/// db.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Database {
    pool: ConnectionPool<PgConnectionManager>,
    admission: Arc<AdmissionController>,
    migrator: Migrator<PgConnectionManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Database {
    /// Warm the pool up to its minimum and build the services on top of it
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let manager = PgConnectionManager::new(config.database_url.clone());
        info!(url = %manager.redacted_url(), "Connecting to database");

        let pool = ConnectionPool::new(manager, config.pool.clone()).await?;
        let store = Arc::new(PgSessionStore::new(pool.clone()));
        let admission = Arc::new(AdmissionController::new(store, config.admission.clone())?);
        let migrator = Migrator::new(
            pool.clone(),
            MigrationSource::new(config.migrations_dir.clone()),
        );

        let mut tasks = Vec::new();
        if let Some(every) = config.maintenance_interval {
            tasks.push(pool.spawn_maintenance(every));
        }
        if let Some(every) = config.session_sweep_interval {
            tasks.push(admission.spawn_sweeper(every));
        }

        Ok(Self {
            pool,
            admission,
            migrator,
            tasks,
        })
    }

    pub fn pool(&self) -> &ConnectionPool<PgConnectionManager> {
        &self.pool
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn migrator(&self) -> &Migrator<PgConnectionManager> {
        &self.migrator
    }

    /// Stop the background tasks and close every pooled connection; later
    /// acquires fail with `PoolClosed`
    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pool.shutdown().await;
    }
}
