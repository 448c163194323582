pub mod config;
pub mod pool;

use crate::core::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Opens, probes and closes the live handles a pool hands out.
///
/// Similar in role to `r2d2::ManageConnection` / `bb8::ManageConnection`:
/// the pool owns bookkeeping, the manager owns the driver.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection to the database target
    async fn connect(&self) -> Result<Self::Connection>;

    /// Lightweight liveness round-trip
    async fn ping(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Cheap synchronous check run on every release.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }

    /// Close a connection the pool is done with
    async fn disconnect(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Lifecycle state of a pooled connection. Only the pool transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Idle,
    InUse,
    Unhealthy,
}
