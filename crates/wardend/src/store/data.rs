//! The authoritative cluster tree and its generation bookkeeping.
//!
//! `ClusterData` is plain single-threaded state: the store actor owns the
//! only instance. Every mutating method returns the bus events it implies,
//! the actor publishes them in order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::Utc;
use warden_common::constants::HB_TIMEOUT_SECS;
use warden_common::{
    ClusterConfig, ClusterStatus, HbMode, HbModeEntry, HbStream, Instance, NodeData, ObjectPath,
    ObjectStatus, PeerState,
};

use super::StoreError;
use super::message::{Delta, Gens, HbMessage, Mutation};
use crate::bus::{Event, Label};

/// An event and the labels it is published with
pub type Publication = (Event, Vec<Label>);

/// Generation of a freshly started node, before any local mutation
pub const INITIAL_GEN: u64 = 1;

pub struct ClusterData {
    localhost: String,
    status: ClusterStatus,
    /// Last generation applied, per peer
    applied: HashMap<String, u64>,
    /// Peers we are waiting a full from; advertised as generation 0
    resync: BTreeSet<String>,
    /// Gens tables last received from each peer
    remote_gens: HashMap<String, Gens>,
    /// When each peer's gens table was received
    heard: HashMap<String, Instant>,
    /// Silence after which a peer's acknowledgements stop holding the patch queue
    peer_timeout: Duration,
    /// Local deltas not yet acknowledged by every peer
    patch_queue: BTreeMap<u64, Vec<Mutation>>,
    max_patch_queue: usize,
    hb_streams: BTreeMap<(String, String), HbStream>,
    hb_modes: BTreeMap<String, HbMode>,
    /// Resync requests not yet handed to the caller
    pending: Vec<Publication>,
}

impl ClusterData {
    pub fn new(localhost: &str, cluster: ClusterConfig, max_patch_queue: usize) -> Self {
        let mut status = ClusterStatus::default();
        status.cluster.config = cluster;
        status.daemon.nodename = localhost.to_string();
        status.nodes.insert(
            localhost.to_string(),
            NodeData {
                generation: INITIAL_GEN,
                ..Default::default()
            },
        );
        let mut data = Self {
            localhost: localhost.to_string(),
            status,
            applied: HashMap::new(),
            resync: BTreeSet::new(),
            remote_gens: HashMap::new(),
            heard: HashMap::new(),
            peer_timeout: Duration::from_secs(HB_TIMEOUT_SECS),
            patch_queue: BTreeMap::new(),
            max_patch_queue: max_patch_queue.max(1),
            hb_streams: BTreeMap::new(),
            hb_modes: BTreeMap::new(),
            pending: Vec::new(),
        };
        data.refresh_daemon_gens();
        data
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn localhost(&self) -> &str {
        &self.localhost
    }

    /// Local generation
    pub fn generation(&self) -> u64 {
        self.status.nodes.get(&self.localhost).map_or(INITIAL_GEN, |n| n.generation)
    }

    /// Last generation applied from `node`, if synced with it
    pub fn last_applied(&self, node: &str) -> Option<u64> {
        if node == self.localhost {
            return Some(self.generation());
        }
        if self.resync.contains(node) {
            return None;
        }
        self.applied.get(node).copied()
    }

    #[cfg(test)]
    pub fn needs_resync(&self, node: &str) -> bool {
        self.resync.contains(node)
    }

    pub fn cluster_nodes(&self) -> &[String] {
        &self.status.cluster.config.nodes
    }

    fn local_node(&self) -> NodeData {
        self.status.nodes.get(&self.localhost).cloned().unwrap_or_default()
    }

    fn local_node_mut(&mut self) -> &mut NodeData {
        self.status.nodes.entry(self.localhost.clone()).or_default()
    }

    // --- reads --------------------------------------------------------------

    /// Deep copy of the tree, optionally filtered
    pub fn snapshot(&self, selector: &str, namespace: &str) -> ClusterStatus {
        self.status
            .clone()
            .with_selector(selector)
            .with_namespace(namespace)
    }

    pub fn instance(&self, path: &ObjectPath, node: &str) -> Option<Instance> {
        self.status.instance(node, &path.to_string()).cloned()
    }

    /// Nodes holding a config for `path`
    pub fn config_nodes(&self, path: &ObjectPath) -> Vec<String> {
        let key = path.to_string();
        self.status
            .nodes
            .iter()
            .filter(|(_, data)| data.instances.get(&key).is_some_and(|i| i.config.is_some()))
            .map(|(node, _)| node.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn instance_status(&self, path: &ObjectPath, node: &str) -> Option<warden_common::InstanceStatus> {
        self.instance(path, node).and_then(|i| i.status)
    }

    // --- local mutations ------------------------------------------------------

    /// Apply a local mutation. A change bumps the local generation and queues
    /// the mutation for gossip; a no-op leaves the generation untouched.
    pub fn apply_local(&mut self, mutation: Mutation) -> (u64, Vec<Publication>) {
        let localhost = self.localhost.clone();
        let events = apply_mutation(&mut self.status, &localhost, &mutation);
        if events.is_empty() {
            return (self.generation(), events);
        }
        let node = self.local_node_mut();
        node.generation += 1;
        let generation = node.generation;
        self.patch_queue.insert(generation, vec![mutation]);
        while self.patch_queue.len() > self.max_patch_queue {
            self.patch_queue.pop_first();
        }
        self.refresh_daemon_gens();
        (generation, events)
    }

    /// Store a locally computed aggregate. Not replicated: every node derives
    /// its own from the instance data.
    pub fn set_object_agg(
        &mut self,
        path: &ObjectPath,
        value: ObjectStatus,
        src_event: Option<String>,
    ) -> Vec<Publication> {
        self.status.objects.insert(path.to_string(), value.clone());
        vec![(
            Event::ObjectAggUpdated {
                path: path.clone(),
                value,
                src_event,
            },
            vec![Label::path(path)],
        )]
    }

    pub fn del_object_agg(&mut self, path: &ObjectPath) -> Vec<Publication> {
        match self.status.objects.remove(&path.to_string()) {
            Some(_) => vec![(
                Event::ObjectAggDeleted { path: path.clone() },
                vec![Label::path(path)],
            )],
            None => Vec::new(),
        }
    }

    // --- remote data ----------------------------------------------------------

    /// Apply the patch `generation` of `node`.
    ///
    /// Only `last_applied(node) + 1` is accepted. Older generations are
    /// duplicates and ignored; anything else flags the node for a full resync.
    pub fn apply_remote(
        &mut self,
        node: &str,
        generation: u64,
        mutations: &[Mutation],
    ) -> Result<Vec<Publication>, StoreError> {
        let Some(last) = self.last_applied(node) else {
            self.request_full(node, 0, generation);
            return Err(StoreError::NotSynced { node: node.to_string() });
        };
        if generation <= last {
            return Ok(Vec::new());
        }
        if generation != last + 1 {
            self.request_full(node, last, generation);
            return Err(StoreError::GenerationGap {
                node: node.to_string(),
                expected: last + 1,
                received: generation,
            });
        }
        let mut events = Vec::new();
        for mutation in mutations {
            events.extend(apply_mutation(&mut self.status, node, mutation));
        }
        self.applied.insert(node.to_string(), generation);
        self.status.nodes.entry(node.to_string()).or_default().generation = generation;
        self.refresh_daemon_gens();
        Ok(events)
    }

    /// Replace the subtree of `node` and publish the differences
    pub fn apply_full(&mut self, node: &str, generation: u64, mut data: NodeData) -> Vec<Publication> {
        data.generation = generation;
        for instance in data.instances.values_mut() {
            if let Some(cfg) = instance.config.as_mut() {
                cfg.nodename = node.to_string();
            }
        }
        let previous = self.status.nodes.remove(node).unwrap_or_default();
        let events = diff_node(node, &previous, &data);
        self.status.nodes.insert(node.to_string(), data);
        self.applied.insert(node.to_string(), generation);
        self.resync.remove(node);
        self.refresh_daemon_gens();
        tracing::debug!(node = %node, generation, changes = events.len(), "applied full");
        events
    }

    /// Process a decoded heartbeat payload
    pub fn apply_message(&mut self, msg: HbMessage) -> Vec<Publication> {
        self.apply_message_at(msg, Instant::now())
    }

    fn apply_message_at(&mut self, msg: HbMessage, now: Instant) -> Vec<Publication> {
        let node = msg.nodename().to_string();
        if node == self.localhost {
            return Vec::new();
        }
        if !self.cluster_nodes().is_empty() && !self.cluster_nodes().contains(&node) {
            tracing::debug!(node = %node, "drop message from node not in cluster config");
            return Vec::new();
        }
        self.remote_gens.insert(node.clone(), msg.gens().clone());
        self.heard.insert(node.clone(), now);

        let mut events = Vec::new();
        match msg {
            HbMessage::Full { generation, data, .. } => {
                events.extend(self.apply_full(&node, generation, data));
            }
            HbMessage::Patch { generation, deltas, .. } => {
                match self.last_applied(&node) {
                    None => self.request_full(&node, 0, generation),
                    Some(last) if generation < last => {
                        tracing::info!(node = %node, generation, last, "peer generation went backward, assume restart");
                        self.request_full(&node, last, generation);
                    }
                    Some(_) => {
                        for delta in deltas {
                            match self.apply_remote(&node, delta.generation, &delta.mutations) {
                                Ok(applied) => events.extend(applied),
                                Err(err) => {
                                    tracing::debug!(node = %node, error = %err, "patch rejected");
                                    break;
                                }
                            }
                        }
                        if let Some(last) = self.last_applied(&node) {
                            if last < generation {
                                self.request_full(&node, last, generation);
                            }
                        }
                    }
                }
            }
            HbMessage::Ping { generation, .. } => match self.last_applied(&node) {
                None => self.request_full(&node, 0, generation),
                Some(last) if last != generation => self.request_full(&node, last, generation),
                Some(_) => {}
            },
        }
        events.extend(self.take_pending());
        events
    }

    /// Resync request events raised since the last call
    pub fn take_pending(&mut self) -> Vec<Publication> {
        std::mem::take(&mut self.pending)
    }

    fn request_full(&mut self, node: &str, last_applied: u64, received: u64) {
        if !self.resync.insert(node.to_string()) {
            return;
        }
        tracing::info!(node = %node, last_applied, received, "request full resync");
        self.refresh_daemon_gens();
        self.pending.push((
            Event::FullResyncRequested {
                node: node.to_string(),
                last_applied,
                received,
            },
            vec![Label::node(node)],
        ));
    }

    // --- outgoing -------------------------------------------------------------

    /// Our gens table: 0 for peers we need a full from
    pub fn advertised_gens(&self) -> Gens {
        let mut gens = Gens::new();
        gens.insert(self.localhost.clone(), self.generation());
        for (node, generation) in &self.applied {
            gens.insert(node.clone(), if self.resync.contains(node) { 0 } else { *generation });
        }
        for node in &self.resync {
            gens.insert(node.clone(), 0);
        }
        gens
    }

    fn peers(&self) -> Vec<String> {
        if self.cluster_nodes().is_empty() {
            return self.remote_gens.keys().cloned().collect();
        }
        self.cluster_nodes()
            .iter()
            .filter(|n| **n != self.localhost)
            .cloned()
            .collect()
    }

    /// Forget the acknowledgements of peers silent for longer than the
    /// peer timeout. A returning peer is resent what it lacks.
    fn expire_silent_peers(&mut self, now: Instant) {
        let timeout = self.peer_timeout;
        let silent: Vec<String> = self
            .heard
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > timeout)
            .map(|(node, _)| node.clone())
            .collect();
        for node in silent {
            tracing::info!(node = %node, "peer silent, acknowledgements dropped");
            self.heard.remove(&node);
            self.remote_gens.remove(&node);
        }
    }

    /// Generation of ours each heard-from peer reports having applied
    fn acks(&self) -> Vec<(String, u64)> {
        self.peers()
            .into_iter()
            .filter_map(|peer| {
                let acked = self.remote_gens.get(&peer)?.get(&self.localhost).copied().unwrap_or(0);
                Some((peer, acked))
            })
            .collect()
    }

    /// Build the next outgoing message and prune acknowledged patches.
    ///
    /// A full is sent when a peer asks for one (acked generation 0) or lags behind
    /// the oldest retained patch; otherwise the patches not yet applied by
    /// the slowest peer; otherwise a ping.
    pub fn build_message(&mut self) -> HbMessage {
        self.build_message_at(Instant::now())
    }

    fn build_message_at(&mut self, now: Instant) -> HbMessage {
        self.expire_silent_peers(now);
        let generation = self.generation();
        let gens = self.advertised_gens();
        let acks = self.acks();

        let lagging = acks
            .iter()
            .any(|(_, acked)| *acked == 0 || (*acked < generation && !self.patch_queue.contains_key(&(acked + 1))));

        let min_acked = acks.iter().map(|(_, a)| *a).min();
        if let Some(min) = min_acked {
            self.patch_queue.retain(|g, _| *g > min);
        }

        if lagging {
            return HbMessage::Full {
                nodename: self.localhost.clone(),
                generation,
                gens,
                data: self.local_node(),
            };
        }

        match min_acked {
            Some(min) if min < generation => HbMessage::Patch {
                nodename: self.localhost.clone(),
                generation,
                gens,
                deltas: self
                    .patch_queue
                    .range(min + 1..)
                    .map(|(g, m)| Delta {
                        generation: *g,
                        mutations: m.clone(),
                    })
                    .collect(),
            },
            _ => HbMessage::Ping {
                nodename: self.localhost.clone(),
                generation,
                gens,
            },
        }
    }

    pub fn patch_queue_len(&self) -> usize {
        self.patch_queue.len()
    }

    // --- heartbeat bookkeeping ------------------------------------------------

    /// Record a stream state change reported by the peer controller
    pub fn set_hb_stream(&mut self, node: &str, hb_id: &str, state: PeerState) {
        let key = (node.to_string(), hb_id.to_string());
        let stream = self.hb_streams.entry(key).or_insert_with(|| HbStream {
            id: hb_id.to_string(),
            node: node.to_string(),
            state,
            last_success: None,
        });
        stream.state = state;
        if state == PeerState::Alive {
            stream.last_success = Some(Utc::now());
        }
        self.refresh_daemon_hb();
    }

    /// Record a peer mode change. A peer falling back to full mode is
    /// forgotten: both sides resync fully when it comes back.
    pub fn set_hb_mode(&mut self, node: &str, mode: HbMode) {
        self.hb_modes.insert(node.to_string(), mode);
        if mode == HbMode::Full && node != self.localhost {
            self.remote_gens.remove(node);
            self.heard.remove(node);
            if self.applied.contains_key(node) {
                self.resync.insert(node.to_string());
            }
        }
        self.refresh_daemon_hb();
        self.refresh_daemon_gens();
    }

    fn refresh_daemon_hb(&mut self) {
        let members = &self.status.cluster.config.nodes;
        let is_member = |node: &String| members.is_empty() || members.contains(node);
        self.hb_modes.retain(|node, _| is_member(node));
        self.status.daemon.hb.modes = self
            .hb_modes
            .iter()
            .map(|(node, mode)| HbModeEntry {
                node: node.clone(),
                mode: *mode,
            })
            .collect();
        self.status.daemon.hb.streams = self
            .hb_streams
            .values()
            .filter(|s| is_member(&s.node))
            .cloned()
            .collect();
    }

    fn refresh_daemon_gens(&mut self) {
        self.status.daemon.gens = self.advertised_gens();
    }
}

fn labels(path: &ObjectPath, node: &str) -> Vec<Label> {
    vec![Label::path(path), Label::node(node)]
}

/// Apply one mutation to `node`'s subtree, returning the events it implies
fn apply_mutation(status: &mut ClusterStatus, node: &str, mutation: &Mutation) -> Vec<Publication> {
    let path = mutation.path().clone();
    let key = path.to_string();
    let mut events = Vec::new();

    let node_data = status.nodes.entry(node.to_string()).or_default();
    let instance = node_data.instances.entry(key.clone()).or_default();

    match mutation {
        Mutation::SetInstanceConfig { value, .. } => {
            if value.scope.is_empty() {
                // an empty scope is a deletion
                return apply_mutation(status, node, &Mutation::DelInstanceConfig { path });
            }
            let mut value = value.clone();
            value.nodename = node.to_string();
            if instance.config.as_ref() != Some(&value) {
                instance.config = Some(value.clone());
                if path.is_cluster() {
                    events.push((
                        Event::ClusterConfigUpdated {
                            node: node.to_string(),
                            value: ClusterConfig {
                                name: status.cluster.config.name.clone(),
                                nodes: value.scope.clone(),
                            },
                        },
                        vec![Label::node(node)],
                    ));
                }
                events.insert(
                    0,
                    (
                        Event::ConfigUpdated {
                            path: path.clone(),
                            node: node.to_string(),
                            value,
                        },
                        labels(&path, node),
                    ),
                );
            }
        }
        Mutation::DelInstanceConfig { .. } => {
            if instance.status.take().is_some() {
                events.push((
                    Event::InstanceStatusDeleted {
                        path: path.clone(),
                        node: node.to_string(),
                    },
                    labels(&path, node),
                ));
            }
            if instance.monitor.take().is_some() {
                events.push((
                    Event::InstanceMonitorDeleted {
                        path: path.clone(),
                        node: node.to_string(),
                    },
                    labels(&path, node),
                ));
            }
            if instance.config.take().is_some() {
                events.push((
                    Event::ConfigDeleted {
                        path: path.clone(),
                        node: node.to_string(),
                    },
                    labels(&path, node),
                ));
            }
        }
        Mutation::SetInstanceStatus { value, .. } => {
            if instance.status.as_ref() != Some(value) {
                instance.status = Some(value.clone());
                events.push((
                    Event::InstanceStatusUpdated {
                        path: path.clone(),
                        node: node.to_string(),
                        value: value.clone(),
                    },
                    labels(&path, node),
                ));
            }
        }
        Mutation::DelInstanceStatus { .. } => {
            if instance.status.take().is_some() {
                events.push((
                    Event::InstanceStatusDeleted {
                        path: path.clone(),
                        node: node.to_string(),
                    },
                    labels(&path, node),
                ));
            }
        }
        Mutation::SetInstanceMonitor { value, .. } => {
            if instance.monitor.as_ref() != Some(value) {
                instance.monitor = Some(value.clone());
                events.push((
                    Event::InstanceMonitorUpdated {
                        path: path.clone(),
                        node: node.to_string(),
                        value: value.clone(),
                    },
                    labels(&path, node),
                ));
            }
        }
        Mutation::DelInstanceMonitor { .. } => {
            if instance.monitor.take().is_some() {
                events.push((
                    Event::InstanceMonitorDeleted {
                        path: path.clone(),
                        node: node.to_string(),
                    },
                    labels(&path, node),
                ));
            }
        }
    }

    if instance.is_empty() {
        node_data.instances.remove(&key);
    }

    if path.is_cluster() && node == status.daemon.nodename {
        if let Some(cfg) = status
            .nodes
            .get(node)
            .and_then(|n| n.instances.get(&key))
            .and_then(|i| i.config.as_ref())
        {
            status.cluster.config.nodes = cfg.scope.clone();
        }
    }

    events
}

/// Events turning `before` into `after` for `node`
fn diff_node(node: &str, before: &NodeData, after: &NodeData) -> Vec<Publication> {
    let mut events = Vec::new();
    let keys: BTreeSet<&String> = before.instances.keys().chain(after.instances.keys()).collect();
    for key in keys {
        let Ok(path) = ObjectPath::parse(key) else {
            tracing::debug!(node = %node, path = %key, "skip unparsable path in full");
            continue;
        };
        let old = before.instances.get(key).cloned().unwrap_or_default();
        let new = after.instances.get(key).cloned().unwrap_or_default();

        match (&old.config, &new.config) {
            (_, Some(cfg)) if old.config.as_ref() != Some(cfg) => events.push((
                Event::ConfigUpdated {
                    path: path.clone(),
                    node: node.to_string(),
                    value: cfg.clone(),
                },
                labels(&path, node),
            )),
            (Some(_), None) => events.push((
                Event::ConfigDeleted {
                    path: path.clone(),
                    node: node.to_string(),
                },
                labels(&path, node),
            )),
            _ => {}
        }
        match (&old.status, &new.status) {
            (_, Some(st)) if old.status.as_ref() != Some(st) => events.push((
                Event::InstanceStatusUpdated {
                    path: path.clone(),
                    node: node.to_string(),
                    value: st.clone(),
                },
                labels(&path, node),
            )),
            (Some(_), None) => events.push((
                Event::InstanceStatusDeleted {
                    path: path.clone(),
                    node: node.to_string(),
                },
                labels(&path, node),
            )),
            _ => {}
        }
        match (&old.monitor, &new.monitor) {
            (_, Some(mon)) if old.monitor.as_ref() != Some(mon) => events.push((
                Event::InstanceMonitorUpdated {
                    path: path.clone(),
                    node: node.to_string(),
                    value: mon.clone(),
                },
                labels(&path, node),
            )),
            (Some(_), None) => events.push((
                Event::InstanceMonitorDeleted {
                    path: path.clone(),
                    node: node.to_string(),
                },
                labels(&path, node),
            )),
            _ => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use warden_common::{InstanceConfig, InstanceMonitor, InstanceStatus, Status};

    fn cluster(nodes: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: "c1".into(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn web() -> ObjectPath {
        ObjectPath::parse("web").unwrap()
    }

    fn config(scope: &[&str]) -> InstanceConfig {
        InstanceConfig {
            checksum: "abc".into(),
            updated: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            scope: scope.iter().map(|n| n.to_string()).collect(),
            nodename: String::new(),
        }
    }

    fn set_status(avail: Status) -> Mutation {
        Mutation::SetInstanceStatus {
            path: web(),
            value: InstanceStatus {
                avail,
                ..Default::default()
            },
        }
    }

    fn kinds(events: &[Publication]) -> Vec<String> {
        events.iter().map(|(e, _)| e.kind().to_string()).collect()
    }

    #[test]
    fn test_apply_local_bumps_gen_once_per_change() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        assert_eq!(data.generation(), INITIAL_GEN);

        let (generation, events) = data.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&["n1", "n2"]),
        });
        assert_eq!(generation, INITIAL_GEN + 1);
        assert_eq!(kinds(&events), vec!["ConfigUpdated"]);

        // same value again: no change, no generation bump
        let (generation, events) = data.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&["n1", "n2"]),
        });
        assert_eq!(generation, INITIAL_GEN + 1);
        assert!(events.is_empty());
        assert_eq!(data.patch_queue_len(), 1);
    }

    #[test]
    fn test_config_deletion_cascades() {
        let mut data = ClusterData::new("n1", cluster(&["n1"]), 100);
        data.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&["n1"]),
        });
        data.apply_local(set_status(Status::Up));
        data.apply_local(Mutation::SetInstanceMonitor {
            path: web(),
            value: InstanceMonitor::default(),
        });

        let (_, events) = data.apply_local(Mutation::DelInstanceConfig { path: web() });
        assert_eq!(
            kinds(&events),
            vec!["InstanceStatusDeleted", "InstanceMonitorDeleted", "ConfigDeleted"]
        );
        assert!(data.instance(&web(), "n1").is_none());
        assert!(data.config_nodes(&web()).is_empty());
    }

    #[test]
    fn test_empty_scope_is_deletion() {
        let mut data = ClusterData::new("n1", cluster(&["n1"]), 100);
        data.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&["n1"]),
        });
        let (_, events) = data.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&[]),
        });
        assert_eq!(kinds(&events), vec!["ConfigDeleted"]);
    }

    #[test]
    fn test_gap_rejected_and_resync_requested() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        data.apply_full("n2", 4, NodeData::default());

        let events = data.apply_remote("n2", 5, &[set_status(Status::Up)]).unwrap();
        assert_eq!(kinds(&events), vec!["InstanceStatusUpdated"]);
        assert_eq!(data.last_applied("n2"), Some(5));

        let err = data.apply_remote("n2", 7, &[set_status(Status::Down)]).unwrap_err();
        match &err {
            StoreError::GenerationGap {
                expected, received, ..
            } => {
                assert_eq!((*expected, *received), (6, 7));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(kinds(&data.take_pending()), vec!["FullResyncRequested"]);

        // not applied, and generation 6 is no longer accepted until a full arrives
        assert_eq!(data.instance_status(&web(), "n2").unwrap().avail, Status::Up);
        assert!(data.needs_resync("n2"));
        assert_eq!(data.advertised_gens()["n2"], 0);
        assert!(data.apply_remote("n2", 6, &[]).is_err());
    }

    #[test]
    fn test_duplicate_patch_ignored() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        data.apply_full("n2", 4, NodeData::default());
        data.apply_remote("n2", 5, &[set_status(Status::Up)]).unwrap();
        assert!(data.apply_remote("n2", 5, &[set_status(Status::Down)]).unwrap().is_empty());
        assert_eq!(data.instance_status(&web(), "n2").unwrap().avail, Status::Up);
    }

    #[test]
    fn test_full_replaces_subtree_and_clears_resync() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        data.apply_full("n2", 2, NodeData::default());
        data.apply_remote("n2", 3, &[set_status(Status::Up)]).unwrap();
        let _ = data.apply_remote("n2", 9, &[]);
        assert!(data.needs_resync("n2"));

        let events = data.apply_full("n2", 9, NodeData::default());
        assert_eq!(kinds(&events), vec!["InstanceStatusDeleted"]);
        assert!(!data.needs_resync("n2"));
        assert_eq!(data.last_applied("n2"), Some(9));
    }

    #[test]
    fn test_unsynced_peer_patch_requests_full() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        let events = data.apply_message(HbMessage::Patch {
            nodename: "n2".into(),
            generation: 3,
            gens: Gens::new(),
            deltas: vec![Delta {
                generation: 3,
                mutations: vec![set_status(Status::Up)],
            }],
        });
        assert_eq!(kinds(&events), vec!["FullResyncRequested"]);
        assert!(data.instance(&web(), "n2").is_none());
    }

    #[test]
    fn test_message_from_foreign_node_dropped() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        let events = data.apply_message(HbMessage::Full {
            nodename: "intruder".into(),
            generation: 3,
            gens: Gens::new(),
            data: NodeData::default(),
        });
        assert!(events.is_empty());
        assert_eq!(data.last_applied("intruder"), None);
    }

    #[test]
    fn test_build_message_full_patch_ping() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);

        // peer never heard: ping
        assert_eq!(data.build_message().kind(), "ping");

        // peer asks for a full
        data.apply_message(HbMessage::Ping {
            nodename: "n2".into(),
            generation: 1,
            gens: Gens::from([("n2".to_string(), 1), ("n1".to_string(), 0)]),
        });
        assert_eq!(data.build_message().kind(), "full");

        // peer acked our generation 1, then we mutate: patch with generation 2
        data.apply_message(HbMessage::Ping {
            nodename: "n2".into(),
            generation: 1,
            gens: Gens::from([("n2".to_string(), 1), ("n1".to_string(), 1)]),
        });
        data.apply_local(set_status(Status::Up));
        match data.build_message() {
            HbMessage::Patch { generation, deltas, .. } => {
                assert_eq!(generation, 2);
                assert_eq!(deltas.iter().map(|d| d.generation).collect::<Vec<_>>(), vec![2]);
            }
            other => panic!("expected patch, got {}", other.kind()),
        }

        // peer acked generation 2: queue pruned, ping
        data.apply_message(HbMessage::Ping {
            nodename: "n2".into(),
            generation: 1,
            gens: Gens::from([("n2".to_string(), 1), ("n1".to_string(), 2)]),
        });
        assert_eq!(data.build_message().kind(), "ping");
        assert_eq!(data.patch_queue_len(), 0);
    }

    #[test]
    fn test_two_nodes_converge() {
        let mut n1 = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        let mut n2 = ClusterData::new("n2", cluster(&["n1", "n2"]), 100);

        n1.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&["n1", "n2"]),
        });
        n1.apply_local(set_status(Status::Up));

        // a few exchange rounds
        for _ in 0..4 {
            let m1 = n1.build_message();
            n2.apply_message(m1);
            let m2 = n2.build_message();
            n1.apply_message(m2);
        }
        assert_eq!(n2.instance(&web(), "n1"), n1.instance(&web(), "n1"));
        assert_eq!(n2.last_applied("n1"), Some(n1.generation()));
        assert_eq!(n2.config_nodes(&web()), vec!["n1"]);

        // steady state: deltas flow as patches
        n1.apply_local(set_status(Status::Down));
        let msg = n1.build_message();
        assert_eq!(msg.kind(), "patch");
        n2.apply_message(msg);
        assert_eq!(n2.instance_status(&web(), "n1").unwrap().avail, Status::Down);
    }

    #[test]
    fn test_gap_resyncs_then_returns_to_patch() {
        let mut n1 = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        let mut n2 = ClusterData::new("n2", cluster(&["n1", "n2"]), 100);
        n1.apply_local(Mutation::SetInstanceConfig {
            path: web(),
            value: config(&["n1", "n2"]),
        });
        for _ in 0..4 {
            n2.apply_message(n1.build_message());
            n1.apply_message(n2.build_message());
        }

        n1.apply_local(set_status(Status::Up));
        n1.apply_local(set_status(Status::Down));
        let HbMessage::Patch {
            nodename,
            generation,
            gens,
            mut deltas,
        } = n1.build_message()
        else {
            panic!("expected a patch");
        };
        assert_eq!(deltas.len(), 2);

        // the first delta is lost
        deltas.remove(0);
        let events = n2.apply_message(HbMessage::Patch {
            nodename,
            generation,
            gens,
            deltas,
        });
        assert_eq!(kinds(&events), vec!["FullResyncRequested"]);
        assert!(n2.needs_resync("n1"));
        assert!(n2.instance_status(&web(), "n1").is_none());

        // n2 advertises 0 for n1, n1 answers with a full
        n1.apply_message(n2.build_message());
        let full = n1.build_message();
        assert_eq!(full.kind(), "full");
        n2.apply_message(full);
        assert!(!n2.needs_resync("n1"));
        assert_eq!(n2.instance_status(&web(), "n1").unwrap().avail, Status::Down);

        // acknowledged: back to patches
        n1.apply_message(n2.build_message());
        n1.apply_local(set_status(Status::Warn));
        let msg = n1.build_message();
        assert_eq!(msg.kind(), "patch");
        n2.apply_message(msg);
        assert_eq!(n2.instance_status(&web(), "n1").unwrap().avail, Status::Warn);
        assert_eq!(n2.last_applied("n1"), Some(n1.generation()));
    }

    fn ack(from: &str, acked: u64) -> HbMessage {
        HbMessage::Ping {
            nodename: from.into(),
            generation: 1,
            gens: Gens::from([(from.to_string(), 1), ("n1".to_string(), acked)]),
        }
    }

    #[test]
    fn test_silent_peer_stops_holding_patch_queue() {
        let start = Instant::now();
        let mut data =
            ClusterData::new("n1", cluster(&["n1", "n2", "n3"]), 1000).with_peer_timeout(Duration::from_secs(15));
        data.apply_message_at(ack("n3", 1), start);
        for i in 0..200 {
            data.apply_local(set_status(if i % 2 == 0 { Status::Up } else { Status::Down }));
        }
        let generation = data.generation();
        assert_eq!(generation, INITIAL_GEN + 200);

        // n3 still counts: everything it lacks is resent
        let at = start + Duration::from_secs(5);
        data.apply_message_at(ack("n2", generation), at);
        match data.build_message_at(at) {
            HbMessage::Patch { deltas, .. } => assert_eq!(deltas.len(), 200),
            other => panic!("expected patch, got {}", other.kind()),
        }

        // n3 silent past the timeout: only n2's acknowledgement holds
        let at = start + Duration::from_secs(20);
        data.apply_message_at(ack("n2", generation), at);
        assert_eq!(data.build_message_at(at).kind(), "ping");
        assert_eq!(data.patch_queue_len(), 0);

        // n3 comes back still at generation 1: it gets a full
        data.apply_message_at(ack("n3", 1), at);
        assert_eq!(data.build_message_at(at).kind(), "full");
    }

    #[test]
    fn test_peer_mode_full_forces_resync() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        data.apply_full("n2", 3, NodeData::default());
        data.set_hb_mode("n2", HbMode::Patch);
        data.set_hb_mode("n2", HbMode::Full);
        assert!(data.needs_resync("n2"));
        assert_eq!(data.snapshot("", "").daemon.hb.modes[0].mode, HbMode::Full);
    }

    #[test]
    fn test_hb_modes_drop_non_members() {
        let mut data = ClusterData::new("n1", cluster(&["n1", "n2"]), 100);
        data.set_hb_mode("n2", HbMode::Patch);
        data.set_hb_mode("gone", HbMode::Patch);
        let modes = data.snapshot("", "").daemon.hb.modes;
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].node, "n2");
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut data = ClusterData::new("n1", cluster(&["n1"]), 100);
        data.apply_local(set_status(Status::Up));
        let mut snap = data.snapshot("", "");
        snap.nodes.clear();
        assert!(data.instance(&web(), "n1").is_some());
    }

    #[test]
    fn test_local_cluster_config_sets_membership() {
        let mut data = ClusterData::new("n1", cluster(&["n1"]), 100);
        let (_, events) = data.apply_local(Mutation::SetInstanceConfig {
            path: ObjectPath::cluster(),
            value: config(&["n1", "n2", "n3"]),
        });
        assert_eq!(kinds(&events), vec!["ConfigUpdated", "ClusterConfigUpdated"]);
        assert_eq!(data.cluster_nodes(), ["n1", "n2", "n3"]);
    }
}
