//! Pluggable heartbeat driver contract.

use anyhow::Result;
use async_trait::async_trait;

use crate::server::Server;
use crate::stream::DownstreamSender;

/// Resource-kind-specific core of a heartbeat.
///
/// The engine is resource agnostic: everything it knows about the advertised
/// record goes through these four operations. Drivers own the last
/// successfully announced snapshot, so a failed send must leave it untouched
/// and the next [`poll`](HeartbeatDriver::poll) keeps reporting a change.
///
/// All methods are called from the single engine worker; drivers need no
/// internal synchronization of their own.
#[async_trait]
pub trait HeartbeatDriver: Send {
    /// Check for changes since the last successful heartbeat. Must report
    /// `true` while no heartbeat has succeeded yet, and must stay cheap: it
    /// runs on every poll tick.
    async fn poll(&mut self) -> bool;

    /// Attempt one heartbeat over the control stream. On success the driver
    /// records the sent snapshot as its new baseline.
    async fn announce(&mut self, sender: &DownstreamSender) -> bool;

    /// Attempt one heartbeat via the stateless upsert RPC. Only called while
    /// no stream sender is available. Drivers without an upsert path return
    /// `false`.
    async fn fallback_announce(&mut self) -> bool;

    /// Whether [`fallback_announce`](HeartbeatDriver::fallback_announce) can
    /// ever succeed for this driver.
    fn supports_fallback(&self) -> bool;
}

/// Legacy single-shot announcement endpoint, used as the fallback path while
/// the control stream is unavailable.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn upsert_node(&self, server: &Server) -> Result<()>;
}
