// SPDX-License-Identifier: MIT
//! Presence heartbeat engine.
//!
//! A long-lived agent announces itself to the cluster controller over the
//! bidirectional inventory control stream. When the stream is unavailable the
//! engine falls back to a stateless upsert RPC, and when neither path has
//! worked for long enough it emits an explicit degraded signal so that
//! external health reporters can react.
//!
//! The moving parts:
//! - [`engine::Heartbeat`] owns the announce/poll/degraded schedules and the
//!   should-announce latch, and drives a pluggable [`driver::HeartbeatDriver`].
//! - [`stream::DownstreamHandle`] yields a fresh [`stream::DownstreamSender`]
//!   whenever the underlying stream reconnects. Reconnect pacing and auth live
//!   behind that handle, not here.
//! - [`ssh::new_ssh_server_heartbeat`] wires up the reference SSH server
//!   driver, including cached cloud metadata enrichment.

pub mod config;
pub mod driver;
pub mod engine;
pub mod interval;
pub mod metadata;
pub mod server;
pub mod ssh;
pub mod stream;

pub use config::{HeartbeatCallback, HeartbeatConfig};
pub use driver::{Announcer, HeartbeatDriver};
pub use engine::{Heartbeat, HeartbeatControl, HeartbeatError};
pub use server::{compare_servers, CloudMetadata, Compared, Server};
pub use ssh::{new_ssh_server_heartbeat, SshServerHeartbeatConfig};
pub use stream::{DownstreamHandle, DownstreamSender, InventoryHeartbeat};
