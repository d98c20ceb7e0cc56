//! The cluster snapshot tree.
//!
//! ```text
//! ClusterStatus
//! ├── cluster.config        name, nodes
//! ├── daemon                nodename, gens, hb { streams, modes }
//! ├── nodes[node]           generation, instances[path] { config, status, monitor }
//! └── objects[path]         aggregated ObjectStatus
//! ```
//!
//! The store owns the authoritative tree; everything else works on clones,
//! and the filters below only ever run on those clones.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::instance::{Instance, ObjectStatus};
use crate::path::ObjectPath;

/// Cluster identity and membership
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterSection {
    pub config: ClusterConfig,
}

/// Liveness of one (peer, heartbeat driver) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Unknown,
    Alive,
    Stale,
}

/// Message mode of a peer: `full` until it is known to apply our deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HbMode {
    #[default]
    Full,
    Patch,
}

/// Heartbeat stream state, as seen by the peer controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HbStream {
    /// Driver stream id, e.g. `hb#1.rx`
    pub id: String,
    pub node: String,
    pub state: PeerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HbModeEntry {
    pub node: String,
    pub mode: HbMode,
}

/// `daemon.hb` section
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaemonHb {
    pub streams: Vec<HbStream>,
    pub modes: Vec<HbModeEntry>,
}

/// Daemon sub-statuses
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaemonSection {
    pub nodename: String,
    /// Last applied generation per node (the local entry is our own generation)
    pub gens: BTreeMap<String, u64>,
    pub hb: DaemonHb,
}

/// Everything one node publishes about itself
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(rename = "gen")]
    pub generation: u64,
    /// Instances keyed by object path string
    pub instances: BTreeMap<String, Instance>,
}

/// Full cluster state, as served to read-only consumers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster: ClusterSection,
    pub daemon: DaemonSection,
    pub nodes: BTreeMap<String, NodeData>,
    pub objects: BTreeMap<String, ObjectStatus>,
}

impl ClusterStatus {
    /// Keep only objects matching a comma-separated list of path globs.
    ///
    /// An empty selector keeps everything. An unusable pattern is skipped.
    pub fn with_selector(mut self, selector: &str) -> Self {
        let selector = selector.trim();
        if selector.is_empty() {
            return self;
        }
        let patterns: Vec<Regex> = selector
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(glob_to_regex)
            .collect();
        self.retain_paths(|p| patterns.iter().any(|re| re.is_match(p)));
        self
    }

    /// Keep only objects of `namespace`. An empty namespace keeps everything.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        if namespace.is_empty() {
            return self;
        }
        self.retain_paths(|p| {
            ObjectPath::parse(p)
                .map(|p| p.namespace == namespace)
                .unwrap_or(false)
        });
        self
    }

    fn retain_paths(&mut self, keep: impl Fn(&str) -> bool) {
        for node in self.nodes.values_mut() {
            node.instances.retain(|p, _| keep(p));
        }
        self.objects.retain(|p, _| keep(p));
    }

    /// Instance records of `path` on `node`, if any
    pub fn instance(&self, node: &str, path: &str) -> Option<&Instance> {
        self.nodes.get(node).and_then(|n| n.instances.get(path))
    }
}

/// `*` matches any sequence, `?` one character; everything else is literal
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterStatus {
        let mut status = ClusterStatus::default();
        let mut node = NodeData::default();
        for p in ["web", "db", "prod/svc/api", "vol/data"] {
            node.instances.insert(p.to_string(), Instance::default());
            status.objects.insert(p.to_string(), ObjectStatus::default());
        }
        status.nodes.insert("n1".into(), node);
        status
    }

    #[test]
    fn test_with_selector_globs() {
        let s = sample().with_selector("w*, vol/*");
        let keys: Vec<_> = s.objects.keys().cloned().collect();
        assert_eq!(keys, vec!["vol/data".to_string(), "web".to_string()]);
        assert_eq!(s.nodes["n1"].instances.len(), 2);
    }

    #[test]
    fn test_with_selector_empty_keeps_all() {
        assert_eq!(sample().with_selector(""), sample());
    }

    #[test]
    fn test_with_namespace() {
        let s = sample().with_namespace("prod");
        assert_eq!(s.objects.len(), 1);
        assert!(s.objects.contains_key("prod/svc/api"));
        assert!(s.instance("n1", "web").is_none());
    }

    #[test]
    fn test_filter_does_not_touch_source() {
        let source = sample();
        let filtered = source.clone().with_namespace("prod");
        assert_eq!(source.objects.len(), 4);
        assert_eq!(filtered.objects.len(), 1);
    }
}
