//! Downstream side of the inventory control stream.
//!
//! The transport (connection, auth, reconnect backoff) lives behind
//! [`DownstreamHandle`]. The engine only consumes two things from it: a
//! channel of fresh [`DownstreamSender`]s, one per stream incarnation, and a
//! close signal. A sender becomes invalid the moment its `done` signal fires
//! and must never be retained past that point.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::server::Server;

/// One heartbeat message as it travels over the control stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryHeartbeat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_server: Option<Server>,
}

/// Sender bound to one incarnation of the control stream.
///
/// Heartbeats are framed as JSON text and queued onto the transport's
/// outbound channel. `done` resolves once when the underlying stream is torn
/// down; the engine then discards the sender and waits for the handle to
/// yield a fresh one.
#[derive(Clone)]
pub struct DownstreamSender {
    frames: mpsc::Sender<String>,
    done: watch::Receiver<bool>,
}

impl DownstreamSender {
    pub fn new(frames: mpsc::Sender<String>, done: watch::Receiver<bool>) -> Self {
        Self { frames, done }
    }

    /// Send one heartbeat over this stream incarnation.
    pub async fn send(&self, heartbeat: &InventoryHeartbeat) -> Result<()> {
        let frame = serde_json::to_string(heartbeat).context("encode inventory heartbeat")?;
        self.frames
            .send(frame)
            .await
            .map_err(|_| anyhow!("control stream closed"))
    }

    /// Resolves once this sender's stream incarnation is gone.
    pub async fn done(&self) {
        let mut done = self.done.clone();
        // An error means the transport dropped its side, which is equally
        // terminal for this sender.
        let _ = done.wait_for(|gone| *gone).await;
    }
}

impl std::fmt::Debug for DownstreamSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamSender")
            .field("done", &*self.done.borrow())
            .finish()
    }
}

/// Handle to the downstream end of the inventory control stream.
///
/// Implementations own the connection lifecycle. Keep the close signal alive
/// for as long as the stream may reconnect; dropping it reads as a permanent
/// shutdown to every consumer.
#[async_trait]
pub trait DownstreamHandle: Send + Sync {
    /// Receive the next sender. Pends while the stream is disconnected and
    /// yields a fresh sender on every (re)connect. `None` means the handle
    /// has shut down for good.
    async fn next_sender(&self) -> Option<DownstreamSender>;

    /// Close signal for the handle itself. The receiver observes `true` once
    /// the handle is shutting down.
    fn closed(&self) -> watch::Receiver<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sender(capacity: usize) -> (DownstreamSender, mpsc::Receiver<String>, watch::Sender<bool>) {
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = watch::channel(false);
        (DownstreamSender::new(frames_tx, done_rx), frames_rx, done_tx)
    }

    fn heartbeat() -> InventoryHeartbeat {
        InventoryHeartbeat {
            ssh_server: Some(Server {
                name: "8f2a".into(),
                addr: "10.0.0.5:3022".into(),
                hostname: "node-1".into(),
                version: "0.4.2".into(),
                labels: Default::default(),
                resource_version: 0,
                expires: None,
                cloud_metadata: None,
            }),
        }
    }

    #[tokio::test]
    async fn send_frames_heartbeat_as_json() {
        let (sender, mut frames, _done) = test_sender(4);
        sender.send(&heartbeat()).await.unwrap();

        let frame = frames.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["sshServer"]["hostname"], "node-1");
    }

    #[tokio::test]
    async fn send_fails_once_transport_is_gone() {
        let (sender, frames, _done) = test_sender(4);
        drop(frames);
        assert!(sender.send(&heartbeat()).await.is_err());
    }

    #[tokio::test]
    async fn done_resolves_on_invalidation() {
        let (sender, _frames, done_tx) = test_sender(4);
        let waiter = tokio::spawn(async move { sender.done().await });
        done_tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn done_resolves_when_transport_drops_signal() {
        let (sender, _frames, done_tx) = test_sender(4);
        drop(done_tx);
        sender.done().await;
    }
}
