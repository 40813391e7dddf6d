// SPDX-License-Identifier: MIT
//! Reference heartbeat driver for SSH servers.
//!
//! Supplies a [`Server`] snapshot on demand via a caller-provided callback,
//! stitches cached cloud metadata onto every outgoing snapshot, and detects
//! change with the semantic comparator. The snapshot is not cached between
//! heartbeats; only the last successfully announced one is kept for
//! comparison.

use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::config::{HeartbeatCallback, HeartbeatConfig};
use crate::driver::{Announcer, HeartbeatDriver};
use crate::engine::Heartbeat;
use crate::metadata::MetadataFetcher;
use crate::server::{compare_servers, CloudMetadata, Compared, Server};
use crate::stream::{DownstreamHandle, DownstreamSender, InventoryHeartbeat};

/// Produces the current advertised server description.
pub type GetServer = Arc<dyn Fn() -> Server + Send + Sync>;

/// Configuration for [`new_ssh_server_heartbeat`].
#[derive(Default)]
pub struct SshServerHeartbeatConfig {
    /// Stream handle used to send heartbeats. Required.
    pub handle: Option<Arc<dyn DownstreamHandle>>,
    /// Gets the latest server spec. Required.
    pub get_server: Option<GetServer>,

    // Everything below is optional.
    /// Legacy upsert endpoint used while the control stream is unavailable.
    /// Without it the driver advertises no fallback.
    pub announcer: Option<Arc<dyn Announcer>>,
    /// Cloud metadata side channel. Without it snapshots go out unenriched.
    pub metadata: Option<Arc<dyn MetadataFetcher>>,
    /// Per-attempt heartbeat callback.
    pub on_heartbeat: Option<HeartbeatCallback>,
    /// Override for the forced re-announce period.
    pub announce_interval: Option<std::time::Duration>,
    /// Override for the change-detection period.
    pub poll_interval: Option<std::time::Duration>,
}

/// Build a heartbeat engine around the SSH server driver.
///
/// Fails if either required parameter is missing.
pub fn new_ssh_server_heartbeat(cfg: SshServerHeartbeatConfig) -> Result<Heartbeat> {
    let Some(handle) = cfg.handle else {
        bail!("missing required parameter handle for ssh heartbeat");
    };
    let Some(get_server) = cfg.get_server else {
        bail!("missing required parameter get_server for ssh heartbeat");
    };

    let driver = SshServerDriver {
        get_server,
        announcer: cfg.announcer,
        fetcher: cfg.metadata,
        metadata: Arc::new(OnceLock::new()),
        prev: None,
    };
    let config = HeartbeatConfig {
        announce_interval: cfg.announce_interval.unwrap_or_default(),
        poll_interval: cfg.poll_interval.unwrap_or_default(),
        on_heartbeat: cfg.on_heartbeat,
        ..Default::default()
    };
    Ok(Heartbeat::new(handle, Box::new(driver), config))
}

/// Heartbeat driver for SSH servers.
pub struct SshServerDriver {
    get_server: GetServer,
    announcer: Option<Arc<dyn Announcer>>,
    fetcher: Option<Arc<dyn MetadataFetcher>>,
    /// Cloud metadata slot, written at most once by the fetch task.
    metadata: Arc<OnceLock<CloudMetadata>>,
    /// Last successfully announced snapshot. `None` until the first success,
    /// so polling reports a change and the first healthy cycle announces.
    prev: Option<Server>,
}

impl SshServerDriver {
    /// Current snapshot, enriched with cloud metadata once available.
    ///
    /// While the metadata slot is still empty a fetch task is kicked off in
    /// the background and the snapshot goes out unenriched; the slot is
    /// published at most once, and later snapshots pick it up here.
    fn current_server(&self) -> Server {
        let mut server = (self.get_server)();
        if let Some(metadata) = self.metadata.get() {
            server.set_cloud_metadata(metadata.clone());
        } else if let Some(fetcher) = &self.fetcher {
            let slot = Arc::clone(&self.metadata);
            let fetcher = Arc::clone(fetcher);
            tokio::spawn(async move {
                match fetcher.get().await {
                    // An empty cloud field leaves the slot open so a later
                    // fetch can try again.
                    Ok(metadata) => {
                        if let Some(cloud) = metadata.cloud {
                            let _ = slot.set(cloud);
                        }
                    }
                    Err(err) => warn!(err = %err, "failed to fetch cloud metadata"),
                }
            });
        }
        server
    }
}

#[async_trait]
impl HeartbeatDriver for SshServerDriver {
    async fn poll(&mut self) -> bool {
        match &self.prev {
            None => true,
            Some(prev) => compare_servers(&self.current_server(), prev) == Compared::Different,
        }
    }

    async fn announce(&mut self, sender: &DownstreamSender) -> bool {
        let server = self.current_server();
        let heartbeat = InventoryHeartbeat {
            ssh_server: Some(server.clone()),
        };
        match sender.send(&heartbeat).await {
            Ok(()) => {
                self.prev = Some(server);
                true
            }
            Err(err) => {
                warn!(err = %err, "failed to perform inventory heartbeat for ssh server");
                false
            }
        }
    }

    async fn fallback_announce(&mut self) -> bool {
        let Some(announcer) = &self.announcer else {
            return false;
        };
        let server = self.current_server();
        match announcer.upsert_node(&server).await {
            Ok(()) => {
                self.prev = Some(server);
                true
            }
            Err(err) => {
                warn!(err = %err, "failed to perform fallback heartbeat for ssh server");
                false
            }
        }
    }

    fn supports_fallback(&self) -> bool {
        self.announcer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use anyhow::{anyhow, Result};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::{mpsc, watch};

    fn server(addr: &str) -> Server {
        Server {
            name: "8f2a".into(),
            addr: addr.into(),
            hostname: "node-1".into(),
            version: "0.4.2".into(),
            labels: BTreeMap::new(),
            resource_version: 0,
            expires: None,
            cloud_metadata: None,
        }
    }

    fn static_driver(addr: &'static str) -> SshServerDriver {
        SshServerDriver {
            get_server: Arc::new(move || server(addr)),
            announcer: None,
            fetcher: None,
            metadata: Arc::new(OnceLock::new()),
            prev: None,
        }
    }

    fn test_sender() -> (DownstreamSender, mpsc::Receiver<String>, watch::Sender<bool>) {
        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = watch::channel(false);
        (DownstreamSender::new(frames_tx, done_rx), frames_rx, done_tx)
    }

    struct RecordingAnnouncer {
        ok: AtomicBool,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn upsert_node(&self, _server: &Server) -> Result<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            if self.ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(anyhow!("upsert endpoint unavailable"))
            }
        }
    }

    struct StubFetcher {
        cloud: Option<CloudMetadata>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataFetcher for StubFetcher {
        async fn get(&self) -> Result<Metadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Metadata {
                cloud: self.cloud.clone(),
            })
        }
    }

    struct NullHandle {
        closed: watch::Receiver<bool>,
    }

    #[async_trait]
    impl DownstreamHandle for NullHandle {
        async fn next_sender(&self) -> Option<DownstreamSender> {
            None
        }

        fn closed(&self) -> watch::Receiver<bool> {
            self.closed.clone()
        }
    }

    fn null_handle() -> Arc<dyn DownstreamHandle> {
        let (_closed_tx, closed) = watch::channel(false);
        Arc::new(NullHandle { closed })
    }

    #[test]
    fn missing_handle_is_rejected() {
        let err = new_ssh_server_heartbeat(SshServerHeartbeatConfig {
            get_server: Some(Arc::new(|| server("10.0.0.5:3022"))),
            ..Default::default()
        })
        .expect_err("handle is required");
        assert!(err.to_string().contains("handle"), "got: {err}");
    }

    #[test]
    fn missing_get_server_is_rejected() {
        let err = new_ssh_server_heartbeat(SshServerHeartbeatConfig {
            handle: Some(null_handle()),
            ..Default::default()
        })
        .expect_err("get_server is required");
        assert!(err.to_string().contains("get_server"), "got: {err}");
    }

    #[test]
    fn complete_config_constructs() {
        new_ssh_server_heartbeat(SshServerHeartbeatConfig {
            handle: Some(null_handle()),
            get_server: Some(Arc::new(|| server("10.0.0.5:3022"))),
            ..Default::default()
        })
        .expect("both required parameters are present");
    }

    #[tokio::test]
    async fn poll_reports_change_before_first_success() {
        let mut driver = static_driver("10.0.0.5:3022");
        assert!(driver.poll().await);
    }

    #[tokio::test]
    async fn announce_records_snapshot_and_poll_settles() {
        let mut driver = static_driver("10.0.0.5:3022");
        let (sender, mut frames, _done) = test_sender();

        assert!(driver.announce(&sender).await);
        let frame = frames.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["sshServer"]["addr"], "10.0.0.5:3022");

        assert!(!driver.poll().await, "unchanged spec must poll clean");
    }

    #[tokio::test]
    async fn failed_announce_leaves_prev_untouched() {
        let mut driver = static_driver("10.0.0.5:3022");
        let (sender, frames, _done) = test_sender();
        drop(frames);

        assert!(!driver.announce(&sender).await);
        assert!(driver.poll().await, "failed send must keep reporting change");
    }

    #[tokio::test]
    async fn spec_change_polls_different_after_success() {
        let addr = Arc::new(Mutex::new("10.0.0.5:3022".to_string()));
        let addr_for_get = Arc::clone(&addr);
        let mut driver = SshServerDriver {
            get_server: Arc::new(move || server(&addr_for_get.lock().unwrap())),
            announcer: None,
            fetcher: None,
            metadata: Arc::new(OnceLock::new()),
            prev: None,
        };
        let (sender, _frames, _done) = test_sender();

        assert!(driver.announce(&sender).await);
        assert!(!driver.poll().await);

        *addr.lock().unwrap() = "10.0.0.6:3022".to_string();
        assert!(driver.poll().await);
    }

    #[tokio::test]
    async fn fallback_upsert_records_snapshot() {
        let announcer = Arc::new(RecordingAnnouncer {
            ok: AtomicBool::new(true),
            upserts: AtomicUsize::new(0),
        });
        let mut driver = static_driver("10.0.0.5:3022");
        driver.announcer = Some(announcer.clone());

        assert!(driver.supports_fallback());
        assert!(driver.fallback_announce().await);
        assert_eq!(announcer.upserts.load(Ordering::SeqCst), 1);
        assert!(!driver.poll().await);
    }

    #[tokio::test]
    async fn failed_fallback_leaves_prev_untouched() {
        let announcer = Arc::new(RecordingAnnouncer {
            ok: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
        });
        let mut driver = static_driver("10.0.0.5:3022");
        driver.announcer = Some(announcer);

        assert!(!driver.fallback_announce().await);
        assert!(driver.poll().await);
    }

    #[tokio::test]
    async fn no_announcer_means_no_fallback() {
        let mut driver = static_driver("10.0.0.5:3022");
        assert!(!driver.supports_fallback());
        assert!(!driver.fallback_announce().await);
    }

    #[tokio::test]
    async fn metadata_enriches_snapshots_once_published() {
        let cloud = CloudMetadata {
            account_id: "123456789012".into(),
            instance_id: "i-0abc".into(),
            region: Some("eu-west-1".into()),
        };
        let fetcher = Arc::new(StubFetcher {
            cloud: Some(cloud.clone()),
            calls: AtomicUsize::new(0),
        });
        let mut driver = static_driver("10.0.0.5:3022");
        driver.fetcher = Some(fetcher.clone());

        // First snapshot goes out unenriched; the fetch runs in the
        // background.
        let first = driver.current_server();
        assert!(first.cloud_metadata.is_none());

        // Wait for the fetch task to publish the slot.
        while driver.metadata.get().is_none() {
            tokio::task::yield_now().await;
        }

        let second = driver.current_server();
        assert_eq!(second.cloud_metadata, Some(cloud));
    }

    #[tokio::test]
    async fn metadata_publication_reads_as_spec_change() {
        let cloud = CloudMetadata {
            account_id: "123456789012".into(),
            instance_id: "i-0abc".into(),
            region: None,
        };
        let fetcher = Arc::new(StubFetcher {
            cloud: Some(cloud),
            calls: AtomicUsize::new(0),
        });
        let mut driver = static_driver("10.0.0.5:3022");
        driver.fetcher = Some(fetcher);
        let (sender, _frames, _done) = test_sender();

        // Announce before the metadata lands.
        assert!(driver.announce(&sender).await);

        while driver.metadata.get().is_none() {
            tokio::task::yield_now().await;
        }

        // The enriched snapshot now differs from the announced baseline, so
        // the engine re-announces it.
        assert!(driver.poll().await);
        assert!(driver.announce(&sender).await);
        assert!(!driver.poll().await);
    }

    #[tokio::test]
    async fn empty_metadata_leaves_slot_open_for_retry() {
        let fetcher = Arc::new(StubFetcher {
            cloud: None,
            calls: AtomicUsize::new(0),
        });
        let mut driver = static_driver("10.0.0.5:3022");
        driver.fetcher = Some(fetcher.clone());

        let _ = driver.current_server();
        while fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(driver.metadata.get().is_none());

        // The next snapshot triggers another fetch attempt.
        let _ = driver.current_server();
        while fetcher.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
    }
}
