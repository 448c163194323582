use crate::core::{DbError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Portal a signed-in user belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Customer,
    Tailor,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Customer => "customer",
            UserRole::Tailor => "tailor",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = DbError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "customer" => Ok(UserRole::Customer),
            "tailor" => Ok(UserRole::Tailor),
            "admin" => Ok(UserRole::Admin),
            other => Err(DbError::Config(format!("unknown user role '{other}'"))),
        }
    }
}

/// One tracked end-user session, keyed by `session_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: Option<i64>,
    pub role: Option<UserRole>,
    pub last_activity: DateTime<Utc>,
}

/// Durable home of the session records admission decisions are computed from.
///
/// `cutoff` is the oldest `last_activity` still inside the timeout window:
/// a record at exactly `cutoff` is active and must not be deleted.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert the record, or overwrite the one with the same `session_id`
    async fn upsert(&self, record: SessionRecord) -> Result<()>;

    /// Count records with `last_activity >= cutoff`
    async fn count_active(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete records with `last_activity < cutoff`, returning how many went
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
