//! Bus event payloads.
//!
//! One closed enum: subscribers register for an [`EventKind`] and match on
//! the variant they asked for.

use std::fmt;
use std::path::PathBuf;

use warden_common::{
    ClusterConfig, HbMode, InstanceConfig, InstanceMonitor, InstanceStatus, MonitorUpdate,
    ObjectPath, ObjectStatus, PeerState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CfgFileUpdated,
    CfgFileRemoved,
    ClusterConfigUpdated,
    ConfigUpdated,
    ConfigDeleted,
    InstanceStatusUpdated,
    InstanceStatusDeleted,
    InstanceMonitorUpdated,
    InstanceMonitorDeleted,
    SetInstanceMonitor,
    ObjectAggUpdated,
    ObjectAggDeleted,
    HbStatusUpdated,
    HbModeUpdated,
    FullResyncRequested,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A local object configuration file was created or modified
    CfgFileUpdated { path: ObjectPath, filename: PathBuf },

    /// A local object configuration file disappeared
    CfgFileRemoved { path: ObjectPath, filename: PathBuf },

    /// The cluster configuration of `node` changed (membership, name)
    ClusterConfigUpdated { node: String, value: ClusterConfig },

    ConfigUpdated {
        path: ObjectPath,
        node: String,
        value: InstanceConfig,
    },

    ConfigDeleted { path: ObjectPath, node: String },

    InstanceStatusUpdated {
        path: ObjectPath,
        node: String,
        value: InstanceStatus,
    },

    InstanceStatusDeleted { path: ObjectPath, node: String },

    InstanceMonitorUpdated {
        path: ObjectPath,
        node: String,
        value: InstanceMonitor,
    },

    InstanceMonitorDeleted { path: ObjectPath, node: String },

    /// Request to change an instance monitor (abort, clear, ...)
    SetInstanceMonitor {
        path: ObjectPath,
        node: String,
        value: MonitorUpdate,
    },

    ObjectAggUpdated {
        path: ObjectPath,
        value: ObjectStatus,
        /// Short description of the event that triggered the recompute
        src_event: Option<String>,
    },

    ObjectAggDeleted { path: ObjectPath },

    /// A (peer, driver) stream changed liveness state
    HbStatusUpdated {
        node: String,
        hb_id: String,
        from: PeerState,
        to: PeerState,
    },

    /// A peer switched between full and patch mode
    HbModeUpdated {
        node: String,
        from: HbMode,
        to: HbMode,
        /// Nodes currently in patch mode
        joined_nodes: Vec<String>,
    },

    /// A gap or restart was detected in the generations received from `node`
    FullResyncRequested {
        node: String,
        last_applied: u64,
        received: u64,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CfgFileUpdated { .. } => EventKind::CfgFileUpdated,
            Self::CfgFileRemoved { .. } => EventKind::CfgFileRemoved,
            Self::ClusterConfigUpdated { .. } => EventKind::ClusterConfigUpdated,
            Self::ConfigUpdated { .. } => EventKind::ConfigUpdated,
            Self::ConfigDeleted { .. } => EventKind::ConfigDeleted,
            Self::InstanceStatusUpdated { .. } => EventKind::InstanceStatusUpdated,
            Self::InstanceStatusDeleted { .. } => EventKind::InstanceStatusDeleted,
            Self::InstanceMonitorUpdated { .. } => EventKind::InstanceMonitorUpdated,
            Self::InstanceMonitorDeleted { .. } => EventKind::InstanceMonitorDeleted,
            Self::SetInstanceMonitor { .. } => EventKind::SetInstanceMonitor,
            Self::ObjectAggUpdated { .. } => EventKind::ObjectAggUpdated,
            Self::ObjectAggDeleted { .. } => EventKind::ObjectAggDeleted,
            Self::HbStatusUpdated { .. } => EventKind::HbStatusUpdated,
            Self::HbModeUpdated { .. } => EventKind::HbModeUpdated,
            Self::FullResyncRequested { .. } => EventKind::FullResyncRequested,
        }
    }

    /// `kind` plus node, for logs and aggregate tagging
    pub fn describe(&self) -> String {
        match self {
            Self::ConfigUpdated { node, .. }
            | Self::ConfigDeleted { node, .. }
            | Self::InstanceStatusUpdated { node, .. }
            | Self::InstanceStatusDeleted { node, .. }
            | Self::InstanceMonitorUpdated { node, .. }
            | Self::InstanceMonitorDeleted { node, .. }
            | Self::SetInstanceMonitor { node, .. } => format!("{}@{}", self.kind(), node),
            other => other.kind().to_string(),
        }
    }
}
