//! PostgreSQL implementations of the pool, session and migration seams.

use crate::admission::store::{SessionRecord, SessionStore};
use crate::connection::ManageConnection;
use crate::connection::pool::ConnectionPool;
use crate::core::{DbError, Result};
use crate::migration::store::{MigrationRecord, MigrationStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection};
use std::fmt;
use tracing::debug;

/// Advisory lock key taken while migrations run
const HISTORY_LOCK_KEY: i64 = 0x6174_656c_6965_72;

const HISTORY_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    id BIGSERIAL PRIMARY KEY,
    migration TEXT NOT NULL UNIQUE,
    batch BIGINT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const UPSERT_SESSION_SQL: &str = r#"
INSERT INTO active_sessions (session_id, user_id, user_role, last_activity)
VALUES ($1, $2, $3, $4)
ON CONFLICT (session_id) DO UPDATE
SET user_id = EXCLUDED.user_id,
    user_role = EXCLUDED.user_role,
    last_activity = EXCLUDED.last_activity
"#;

/// Render a connection URL with its password hidden
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

/// Opens `sqlx::PgConnection`s to one database URL
#[derive(Clone)]
pub struct PgConnectionManager {
    url: String,
}

impl PgConnectionManager {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn redacted_url(&self) -> String {
        redact_url(&self.url)
    }
}

impl fmt::Debug for PgConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnectionManager")
            .field("url", &self.redacted_url())
            .finish()
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        Ok(PgConnection::connect(&self.url).await?)
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<()> {
        Ok(conn.ping().await?)
    }

    async fn disconnect(&self, conn: PgConnection) {
        if let Err(err) = conn.close().await {
            debug!(error = %err, "Connection did not close cleanly");
        }
    }
}

/// Session records in the `active_sessions` table
#[derive(Clone)]
pub struct PgSessionStore {
    pool: ConnectionPool<PgConnectionManager>,
}

impl PgSessionStore {
    pub fn new(pool: ConnectionPool<PgConnectionManager>) -> Self {
        Self { pool }
    }
}

// Statement errors that mean the socket is gone mark the lease unhealthy
// through `PoolGuard::check`, so the pool never hands that connection out again.
#[async_trait]
impl SessionStore for PgSessionStore {
    async fn upsert(&self, record: SessionRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query(UPSERT_SESSION_SQL)
            .bind(&record.session_id)
            .bind(record.user_id)
            .bind(record.role.map(|role| role.as_str()))
            .bind(record.last_activity)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from);
        conn.check(result)?;
        conn.release().await
    }

    async fn count_active(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let result: Result<(i64,)> =
            sqlx::query_as("SELECT COUNT(*) FROM active_sessions WHERE last_activity >= $1")
                .bind(cutoff)
                .fetch_one(&mut *conn)
                .await
                .map_err(DbError::from);
        let (count,) = conn.check(result)?;
        conn.release().await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM active_sessions WHERE last_activity < $1")
            .bind(cutoff)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from);
        let deleted = conn.check(result)?.rows_affected();
        conn.release().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl MigrationStore for PgConnection {
    async fn lock_history(&mut self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(HISTORY_LOCK_KEY)
            .execute(&mut *self)
            .await?;
        Ok(())
    }

    async fn unlock_history(&mut self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(HISTORY_LOCK_KEY)
            .execute(&mut *self)
            .await?;
        Ok(())
    }

    async fn ensure_history(&mut self) -> Result<()> {
        sqlx::query(HISTORY_TABLE_DDL).execute(&mut *self).await?;
        Ok(())
    }

    async fn executed(&mut self) -> Result<Vec<MigrationRecord>> {
        let rows: Vec<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT migration, batch, applied_at FROM migrations ORDER BY batch, migration",
        )
        .fetch_all(&mut *self)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(migration, batch, applied_at)| MigrationRecord {
                migration,
                batch,
                applied_at,
            })
            .collect())
    }

    async fn apply(&mut self, name: &str, sql: &str, batch: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(sql)).await?;
        sqlx::query("INSERT INTO migrations (migration, batch, applied_at) VALUES ($1, $2, $3)")
            .bind(name)
            .bind(batch)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revert(&mut self, name: &str, sql: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(sql)).await?;
        sqlx::query("DELETE FROM migrations WHERE migration = $1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
