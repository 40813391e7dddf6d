// SPDX-License-Identifier: MIT
//! Server snapshot advertised through heartbeats, and the semantic comparator
//! that decides whether a snapshot is worth re-announcing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cloud instance identity stitched onto a server snapshot once the
/// asynchronous metadata fetch has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMetadata {
    pub account_id: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// A snapshot of the advertised server description.
///
/// Snapshots are produced on demand by the agent and are not cached between
/// heartbeats, so every field here is cheap to clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Stable unique identity of the server record.
    pub name: String,
    /// Advertised dial address.
    pub addr: String,
    pub hostname: String,
    /// Agent software version.
    pub version: String,
    /// Static labels attached to the record.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Backend write counter. Bumped on every upsert; carries no meaning of
    /// its own.
    #[serde(default)]
    pub resource_version: u64,
    /// Record expiry as maintained by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_metadata: Option<CloudMetadata>,
}

impl Server {
    pub fn set_cloud_metadata(&mut self, metadata: CloudMetadata) {
        self.cloud_metadata = Some(metadata);
    }
}

/// Outcome of comparing two server snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compared {
    Equal,
    Different,
}

/// Compare two snapshots by their externally meaningful fields.
///
/// Bookkeeping that the backend churns on every write (`resource_version`,
/// `expires`) is ignored, otherwise every refresh would look like a change
/// and force a re-announce.
pub fn compare_servers(a: &Server, b: &Server) -> Compared {
    let same = a.name == b.name
        && a.addr == b.addr
        && a.hostname == b.hostname
        && a.version == b.version
        && a.labels == b.labels
        && a.cloud_metadata == b.cloud_metadata;
    if same {
        Compared::Equal
    } else {
        Compared::Different
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Server {
        Server {
            name: "8f2a".into(),
            addr: "10.0.0.5:3022".into(),
            hostname: "node-1".into(),
            version: "0.4.2".into(),
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            resource_version: 7,
            expires: None,
            cloud_metadata: None,
        }
    }

    #[test]
    fn identical_servers_are_equal() {
        assert_eq!(compare_servers(&sample(), &sample()), Compared::Equal);
    }

    #[test]
    fn bookkeeping_fields_are_ignored() {
        let a = sample();
        let mut b = sample();
        b.resource_version = 99;
        b.expires = Some(Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap());
        assert_eq!(compare_servers(&a, &b), Compared::Equal);
    }

    #[test]
    fn label_change_is_different() {
        let a = sample();
        let mut b = sample();
        b.labels.insert("env".into(), "staging".into());
        assert_eq!(compare_servers(&a, &b), Compared::Different);
    }

    #[test]
    fn addr_change_is_different() {
        let a = sample();
        let mut b = sample();
        b.addr = "10.0.0.6:3022".into();
        assert_eq!(compare_servers(&a, &b), Compared::Different);
    }

    #[test]
    fn cloud_metadata_is_semantic() {
        let a = sample();
        let mut b = sample();
        b.set_cloud_metadata(CloudMetadata {
            account_id: "123456789012".into(),
            instance_id: "i-0abc".into(),
            region: Some("eu-west-1".into()),
        });
        assert_eq!(compare_servers(&a, &b), Compared::Different);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["resourceVersion"], 7);
        assert_eq!(json["addr"], "10.0.0.5:3022");
        assert!(json.get("cloudMetadata").is_none());
    }
}
