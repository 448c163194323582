//! Scriptable fakes shared by the in-crate unit tests.

use crate::connection::ManageConnection;
use crate::core::{DbError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    opened: AtomicU64,
    disconnected: AtomicU64,
    fail_next_connects: AtomicU32,
    refuse_connects: AtomicBool,
    ping_delay_ms: AtomicU64,
    disconnect_delay_ms: AtomicU64,
    dead: Mutex<HashSet<u64>>,
}

/// Connection manager whose failures are switched on from the test body.
#[derive(Clone, Default)]
pub(crate) struct FakeManager {
    state: Arc<FakeState>,
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    pub serial: u64,
    pub broken: bool,
}

impl FakeManager {
    pub fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> u64 {
        self.state.disconnected.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.fail_next_connects.store(count, Ordering::SeqCst);
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.state.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn slow_pings(&self, delay: Duration) {
        self.state
            .ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn slow_disconnects(&self, delay: Duration) {
        self.state
            .disconnect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every connection opened so far stops answering pings.
    pub fn kill_all(&self) {
        let opened = self.opened();
        self.state.dead.lock().unwrap().extend(1..=opened);
    }

    pub fn kill(&self, serial: u64) {
        self.state.dead.lock().unwrap().insert(serial);
    }
}

#[async_trait]
impl ManageConnection for FakeManager {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection> {
        if self.state.refuse_connects.load(Ordering::SeqCst) {
            return Err(DbError::Query("connection refused".into()));
        }
        let pending_failures = self.state.fail_next_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.state
                .fail_next_connects
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(DbError::Query("connection reset by peer".into()));
        }
        let serial = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeConnection {
            serial,
            broken: false,
        })
    }

    async fn ping(&self, conn: &mut FakeConnection) -> Result<()> {
        let delay = self.state.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.dead.lock().unwrap().contains(&conn.serial) {
            return Err(DbError::Query("server closed the connection".into()));
        }
        Ok(())
    }

    fn has_broken(&self, conn: &mut FakeConnection) -> bool {
        conn.broken
    }

    async fn disconnect(&self, conn: FakeConnection) {
        let delay = self.state.disconnect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state.disconnected.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }
}
