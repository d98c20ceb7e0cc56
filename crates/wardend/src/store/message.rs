//! Replication payloads carried by the heartbeat transport.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use warden_common::{InstanceConfig, InstanceMonitor, InstanceStatus, NodeData, ObjectPath};

/// One change to a node's own subtree. A local mutation batch becomes the
/// patch of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    SetInstanceConfig { path: ObjectPath, value: InstanceConfig },
    /// Also removes the instance status and monitor
    DelInstanceConfig { path: ObjectPath },
    SetInstanceStatus { path: ObjectPath, value: InstanceStatus },
    DelInstanceStatus { path: ObjectPath },
    SetInstanceMonitor { path: ObjectPath, value: InstanceMonitor },
    DelInstanceMonitor { path: ObjectPath },
}

impl Mutation {
    pub fn path(&self) -> &ObjectPath {
        match self {
            Self::SetInstanceConfig { path, .. }
            | Self::DelInstanceConfig { path }
            | Self::SetInstanceStatus { path, .. }
            | Self::DelInstanceStatus { path }
            | Self::SetInstanceMonitor { path, .. }
            | Self::DelInstanceMonitor { path } => path,
        }
    }
}

/// The mutations of one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(rename = "gen")]
    pub generation: u64,
    pub mutations: Vec<Mutation>,
}

/// Generation table: last generation applied per node. The sender's own
/// entry is its current generation; 0 means "send me a full".
pub type Gens = BTreeMap<String, u64>;

/// A heartbeat payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HbMessage {
    /// The sender's whole subtree as of `generation`
    Full {
        nodename: String,
        #[serde(rename = "gen")]
        generation: u64,
        gens: Gens,
        data: NodeData,
    },
    /// Consecutive per-generation deltas, oldest first, up to `generation`
    Patch {
        nodename: String,
        #[serde(rename = "gen")]
        generation: u64,
        gens: Gens,
        deltas: Vec<Delta>,
    },
    /// Liveness and acknowledgements only
    Ping {
        nodename: String,
        #[serde(rename = "gen")]
        generation: u64,
        gens: Gens,
    },
}

impl HbMessage {
    pub fn nodename(&self) -> &str {
        match self {
            Self::Full { nodename, .. } | Self::Patch { nodename, .. } | Self::Ping { nodename, .. } => {
                nodename
            }
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Self::Full { generation, .. } | Self::Patch { generation, .. } | Self::Ping { generation, .. } => *generation,
        }
    }

    pub fn gens(&self) -> &Gens {
        match self {
            Self::Full { gens, .. } | Self::Patch { gens, .. } | Self::Ping { gens, .. } => gens,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Full { .. } => "full",
            Self::Patch { .. } => "patch",
            Self::Ping { .. } => "ping",
        }
    }
}
