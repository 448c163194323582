//! In-memory stand-in for the database, shared by the integration tests.
//!
//! Scripts containing the word `FAIL` error when applied or reverted, which
//! lets a test place a broken migration anywhere in a directory. Scripts
//! containing `DISCONNECT` fail as if the server dropped the connection.

#![allow(dead_code)]

use async_trait::async_trait;
use atelier_db::connection::ManageConnection;
use atelier_db::migration::{MigrationRecord, MigrationStore};
use atelier_db::{ConnectionPool, DbError, MigrationSource, Migrator, PoolConfig, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

pub const FAIL_MARKER: &str = "FAIL";
pub const DISCONNECT_MARKER: &str = "DISCONNECT";

#[derive(Default)]
pub struct FakeDatabase {
    history: Mutex<Vec<MigrationRecord>>,
    history_lock: Arc<tokio::sync::Mutex<()>>,
    executed_sql: Mutex<Vec<String>>,
    writers: AtomicUsize,
    max_writers: AtomicUsize,
}

impl FakeDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Names in the history table, ordered by batch then name
    pub fn history(&self) -> Vec<(String, i64)> {
        let mut rows: Vec<(String, i64)> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.migration.clone(), r.batch))
            .collect();
        rows.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    /// Every script body run so far, forward and rollback
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed_sql.lock().unwrap().clone()
    }

    /// Most scripts that were ever running at the same time
    pub fn max_concurrent_writers(&self) -> usize {
        self.max_writers.load(Ordering::SeqCst)
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let writers = self.writers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_writers.fetch_max(writers, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.writers.fetch_sub(1, Ordering::SeqCst);

        self.executed_sql.lock().unwrap().push(sql.to_string());
        if sql.contains(DISCONNECT_MARKER) {
            return Err(DbError::ConnectionLost(
                "server closed the connection unexpectedly".into(),
            ));
        }
        if sql.contains(FAIL_MARKER) {
            return Err(DbError::Query(format!(
                "syntax error at or near \"{FAIL_MARKER}\""
            )));
        }
        Ok(())
    }
}

pub struct FakeConnection {
    db: Arc<FakeDatabase>,
    history_guard: Option<OwnedMutexGuard<()>>,
}

#[derive(Clone)]
pub struct FakeManager {
    db: Arc<FakeDatabase>,
}

impl FakeManager {
    pub fn new(db: Arc<FakeDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ManageConnection for FakeManager {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection> {
        Ok(FakeConnection {
            db: self.db.clone(),
            history_guard: None,
        })
    }

    async fn ping(&self, _conn: &mut FakeConnection) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl MigrationStore for FakeConnection {
    async fn lock_history(&mut self) -> Result<()> {
        let guard = self.db.history_lock.clone().lock_owned().await;
        self.history_guard = Some(guard);
        Ok(())
    }

    async fn unlock_history(&mut self) -> Result<()> {
        self.history_guard = None;
        Ok(())
    }

    async fn ensure_history(&mut self) -> Result<()> {
        Ok(())
    }

    async fn executed(&mut self) -> Result<Vec<MigrationRecord>> {
        let mut records = self.db.history.lock().unwrap().clone();
        records.sort_by(|a, b| a.batch.cmp(&b.batch).then_with(|| a.migration.cmp(&b.migration)));
        Ok(records)
    }

    async fn apply(&mut self, name: &str, sql: &str, batch: i64) -> Result<()> {
        self.db.execute(sql).await?;
        self.db.history.lock().unwrap().push(MigrationRecord {
            migration: name.to_string(),
            batch,
            applied_at: Utc::now(),
        });
        Ok(())
    }

    async fn revert(&mut self, name: &str, sql: &str) -> Result<()> {
        self.db.execute(sql).await?;
        self.db.history.lock().unwrap().retain(|r| r.migration != name);
        Ok(())
    }
}

pub async fn fake_pool(db: &Arc<FakeDatabase>, max_connections: usize) -> ConnectionPool<FakeManager> {
    let config = PoolConfig::new(1, max_connections).acquire_timeout(Duration::from_secs(5));
    ConnectionPool::new(FakeManager::new(db.clone()), config)
        .await
        .unwrap()
}

pub async fn fake_migrator(db: &Arc<FakeDatabase>, dir: &Path) -> Migrator<FakeManager> {
    Migrator::new(fake_pool(db, 4).await, MigrationSource::new(dir))
}

pub fn write_script(dir: &Path, file_name: &str, sql: &str) {
    std::fs::write(dir.join(file_name), sql).unwrap();
}
