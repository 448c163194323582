//! Session admission control
//!
//! Gates the whole application on the number of distinct sessions seen
//! within [`SESSION_TIMEOUT`]. Every decision is computed from the session
//! store on the spot; nothing about capacity is cached between requests.

pub mod memory;
pub mod store;

use crate::core::{DbError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use memory::MemorySessionStore;
pub use store::{SessionRecord, SessionStore, UserRole};

/// Sessions idle for longer than this no longer count toward capacity
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Oldest `last_activity` still counted as active at `now`
pub fn session_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - TimeDelta::seconds(SESSION_TIMEOUT.as_secs() as i64)
}

/// What to do when the session store cannot answer a capacity check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityFailurePolicy {
    /// Admit the request and log a warning. A store outage does not take
    /// the site down with it.
    #[default]
    FailOpen,
    /// Turn the request away with the busy response
    FailClosed,
}

impl FromStr for CapacityFailurePolicy {
    type Err = DbError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "open" | "fail-open" => Ok(Self::FailOpen),
            "closed" | "fail-closed" => Ok(Self::FailClosed),
            other => Err(DbError::Config(format!(
                "capacity failure policy must be 'open' or 'closed', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Ceiling on concurrently active sessions
    pub max_sessions: u64,
    pub failure_policy: CapacityFailurePolicy,
    /// Retry hint sent with the busy response
    pub retry_after: Duration,
}

impl AdmissionConfig {
    pub fn new(max_sessions: u64) -> Self {
        Self {
            max_sessions,
            ..Self::default()
        }
    }

    pub fn failure_policy(mut self, policy: CapacityFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_sessions == 0 {
            return Err("max_sessions must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            failure_policy: CapacityFailurePolicy::FailOpen,
            retry_after: Duration::from_secs(30),
        }
    }
}

/// Identity of the session behind a request, supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: Option<i64>,
    pub role: Option<UserRole>,
}

impl SessionContext {
    pub fn anonymous(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            role: None,
        }
    }

    pub fn user(session_id: impl Into<String>, user_id: i64, role: UserRole) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: Some(user_id),
            role: Some(role),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapacitySnapshot {
    pub active: u64,
    pub max: u64,
    pub available: u64,
    /// `active / max` as a percentage, one decimal place
    pub percentage: f64,
}

impl CapacitySnapshot {
    pub fn new(active: u64, max: u64) -> Self {
        let percentage = if max == 0 {
            100.0
        } else {
            (active as f64 / max as f64 * 1000.0).round() / 10.0
        };
        Self {
            active,
            max,
            available: max.saturating_sub(active),
            percentage,
        }
    }

    pub fn is_full(&self) -> bool {
        self.active >= self.max
    }
}

/// Payload of the busy response shown to requests turned away at capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusyNotice {
    pub active_users: u64,
    pub max_users: u64,
    pub available_slots: u64,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Busy(BusyNotice),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepReport {
    pub removed: u64,
    pub capacity: CapacitySnapshot,
}

pub struct AdmissionController {
    store: Arc<dyn SessionStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn SessionStore>, config: AdmissionConfig) -> Result<Self> {
        config.validate().map_err(DbError::Config)?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Sessions with activity inside the timeout window
    pub async fn active_user_count(&self) -> Result<u64> {
        self.store
            .count_active(session_cutoff(Utc::now()))
            .await
            .map_err(|err| DbError::CapacityCheckFailed(err.to_string()))
    }

    pub async fn is_at_capacity(&self) -> Result<bool> {
        Ok(self.capacity_info().await?.is_full())
    }

    pub async fn capacity_info(&self) -> Result<CapacitySnapshot> {
        let active = self.active_user_count().await?;
        Ok(CapacitySnapshot::new(active, self.config.max_sessions))
    }

    /// Record activity for an admitted request
    pub async fn register_session(&self, session: &SessionContext) -> Result<()> {
        self.store
            .upsert(SessionRecord {
                session_id: session.session_id.clone(),
                user_id: session.user_id,
                role: session.role,
                last_activity: Utc::now(),
            })
            .await
    }

    /// Run the admission algorithm for one request
    ///
    /// A request turned away is never registered, so it does not count
    /// toward capacity. Requests without a session are checked but not
    /// tracked.
    pub async fn admit(&self, session: Option<&SessionContext>) -> Admission {
        match self.capacity_info().await {
            Ok(snapshot) if snapshot.is_full() => {
                debug!(active = snapshot.active, max = snapshot.max, "Request turned away at capacity");
                return Admission::Busy(self.busy_notice(snapshot));
            }
            Ok(_) => {}
            Err(err) => match self.config.failure_policy {
                CapacityFailurePolicy::FailOpen => {
                    warn!(error = %err, "Capacity check failed, admitting request (fail-open)");
                }
                CapacityFailurePolicy::FailClosed => {
                    warn!(error = %err, "Capacity check failed, rejecting request (fail-closed)");
                    let max = self.config.max_sessions;
                    return Admission::Busy(self.busy_notice(CapacitySnapshot::new(max, max)));
                }
            },
        }

        if let Some(session) = session {
            if let Err(err) = self.register_session(session).await {
                warn!(session_id = %session.session_id, error = %err, "Could not record session activity");
            }
        }

        Admission::Admitted
    }

    fn busy_notice(&self, snapshot: CapacitySnapshot) -> BusyNotice {
        BusyNotice {
            active_users: snapshot.active,
            max_users: snapshot.max,
            available_slots: snapshot.available,
            retry_after_secs: self.config.retry_after.as_secs(),
        }
    }

    /// Delete sessions whose last activity is strictly older than the timeout
    pub async fn cleanup(&self) -> Result<u64> {
        self.store.delete_expired(session_cutoff(Utc::now())).await
    }

    /// `cleanup` followed by a fresh capacity reading
    pub async fn sweep(&self) -> Result<SweepReport> {
        let removed = self.cleanup().await?;
        let capacity = self.capacity_info().await?;
        info!(
            removed,
            active = capacity.active,
            percentage = capacity.percentage,
            "Expired sessions swept"
        );
        Ok(SweepReport { removed, capacity })
    }

    /// Run `sweep` every `every` until the controller is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = controller.sweep().await {
                    warn!(error = %err, "Session sweep failed");
                }
            }
        })
    }
}
