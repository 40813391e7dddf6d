//! Cloud metadata side channel.
//!
//! Fetching instance identity from a cloud metadata service is slow and may
//! never succeed (bare metal, firewalled IMDS). The SSH driver therefore
//! treats this as a fire-and-forget side channel: the fetch runs off the
//! worker, publishes at most once, and heartbeats proceed without it in the
//! meantime.

use anyhow::Result;
use async_trait::async_trait;

use crate::server::CloudMetadata;

/// Result of a metadata fetch. `cloud` stays `None` on platforms without a
/// cloud identity, which leaves the published slot empty and allows a later
/// fetch to try again.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub cloud: Option<CloudMetadata>,
}

/// Source of instance metadata, typically backed by the platform IMDS.
#[async_trait]
pub trait MetadataFetcher: Send + Sync {
    async fn get(&self) -> Result<Metadata>;
}
