//! Per-node instance records: config, status and monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::status::{Placement, Provisioned, Status};

/// Configuration file summary of an object on one node.
///
/// `scope` is never empty while the record exists: an empty scope means the
/// record must be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Hex md5 of the configuration file
    #[serde(rename = "csum")]
    pub checksum: String,

    /// Configuration file modification time
    pub updated: DateTime<Utc>,

    /// Nodes expected to host an instance, in configured order
    pub scope: Vec<String>,

    /// Node publishing this record (not serialized, implied by the tree)
    #[serde(skip)]
    pub nodename: String,
}

impl InstanceConfig {
    /// Compare the replicated fields only (node identity is not compared)
    pub fn same_content(&self, other: &InstanceConfig) -> bool {
        self.updated == other.updated && self.checksum == other.checksum && self.scope == other.scope
    }
}

/// Status of one resource of an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub rid: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub status: Status,
    #[serde(default)]
    pub provisioned: Provisioned,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

/// Local evaluation of an instance, produced by the status evaluator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(default)]
    pub avail: Status,
    #[serde(default)]
    pub overall: Status,
    #[serde(default)]
    pub provisioned: Provisioned,

    /// Set when the instance is frozen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl InstanceStatus {
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }
}

/// Cluster-wide orchestration target of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalExpect {
    #[default]
    None,
    Aborted,
    Frozen,
    Thawed,
    Started,
    Stopped,
    Provisioned,
    Unprovisioned,
    Purged,
}

/// State of the instance monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    #[default]
    Idle,
    Starting,
    Stopping,
    Freezing,
    Thawing,
    Provisioning,
    Unprovisioning,
    StartFailed,
    StopFailed,
}

/// Restart bookkeeping of one resource.
///
/// Legacy peers send the bare retry count instead of the object; both
/// shapes are accepted, see [`MonitorRestart`]'s `Deserialize`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MonitorRestart {
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

impl<'de> Deserialize<'de> for MonitorRestart {
    /// Attempt the object shape first, then the bare integer shape.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Full {
            retries: u32,
            #[serde(default)]
            updated: Option<DateTime<Utc>>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Full(Full),
            Retries(u32),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Full(f) => MonitorRestart {
                retries: f.retries,
                updated: f.updated,
            },
            Repr::Retries(retries) => MonitorRestart {
                retries,
                updated: None,
            },
        })
    }
}

/// Orchestration intent of one instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceMonitor {
    #[serde(default)]
    pub global_expect: GlobalExpect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_expect_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: MonitorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_updated: Option<DateTime<Utc>>,
    /// Is this instance the declared placement leader
    #[serde(default)]
    pub is_leader: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub restart: BTreeMap<String, MonitorRestart>,
}

/// Partial update of an instance monitor (abort, clear, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MonitorUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_expect: Option<GlobalExpect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<MonitorState>,
}

impl InstanceMonitor {
    /// Apply a partial update, returning true if anything changed
    pub fn apply(&mut self, update: &MonitorUpdate, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if let Some(ge) = update.global_expect {
            if ge != self.global_expect {
                self.global_expect = ge;
                self.global_expect_updated = Some(now);
                changed = true;
            }
        }
        if let Some(state) = update.state {
            if state != self.state {
                self.state = state;
                self.state_updated = Some(now);
                changed = true;
            }
        }
        changed
    }
}

/// All records of one object on one node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<InstanceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor: Option<InstanceMonitor>,
}

impl Instance {
    pub fn is_empty(&self) -> bool {
        self.config.is_none() && self.status.is_none() && self.monitor.is_none()
    }
}

/// Aggregated, derived status of an object across its nodes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub avail: Status,
    pub overall: Status,
    pub provisioned: Provisioned,
    pub frozen: crate::status::Frozen,
    pub placement: Placement,
}
