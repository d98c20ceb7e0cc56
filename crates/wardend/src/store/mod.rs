//! Replicated cluster store.
//!
//! A single-writer actor owns the [`ClusterData`] tree. Mutations and reads
//! are commands on one channel; reads are answered with copies. On every
//! heartbeat tick the actor builds the next outgoing [`HbMessage`] and hands
//! the encoded bytes to the heartbeat transmitters.

mod data;
mod message;

pub use data::{ClusterData, INITIAL_GEN, Publication};
pub use message::{Delta, Gens, HbMessage, Mutation};

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use warden_common::{ClusterConfig, ClusterStatus, Instance, ObjectPath, ObjectStatus};

use crate::bus::{Bus, Event, EventKind};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// A patch skipped one or more generations; a full resync was requested
    #[error("generation gap from {node}: expected {expected}, received {received}")]
    GenerationGap {
        node: String,
        expected: u64,
        received: u64,
    },

    /// Nothing applied from this node yet, or a full resync is pending
    #[error("not synced with {node}")]
    NotSynced { node: String },

    #[error("store is not running")]
    Closed,

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub nodename: String,
    pub cluster: ClusterConfig,
    /// Interval between two outgoing heartbeat messages
    pub interval: Duration,
    /// Silence after which a peer no longer holds back patch pruning
    pub peer_timeout: Duration,
    pub max_patch_queue: usize,
    pub queue_size: usize,
}

#[derive(Debug)]
pub enum StoreCmd {
    ApplyLocal {
        mutation: Mutation,
        reply: oneshot::Sender<u64>,
    },
    ApplyRemote {
        node: String,
        generation: u64,
        mutations: Vec<Mutation>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    ApplyMessage {
        msg: HbMessage,
    },
    SetObjectAgg {
        path: ObjectPath,
        value: ObjectStatus,
        src_event: Option<String>,
    },
    DelObjectAgg {
        path: ObjectPath,
    },
    Snapshot {
        selector: String,
        namespace: String,
        reply: oneshot::Sender<ClusterStatus>,
    },
    GetInstance {
        path: ObjectPath,
        node: String,
        reply: oneshot::Sender<Option<Instance>>,
    },
    ClusterNodes {
        reply: oneshot::Sender<Vec<String>>,
    },
    ConfigNodes {
        path: ObjectPath,
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable client of the store actor
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCmd>,
}

impl StoreHandle {
    pub fn from_sender(tx: mpsc::Sender<StoreCmd>) -> Self {
        Self { tx }
    }

    async fn send(&self, cmd: StoreCmd) -> Result<(), StoreError> {
        self.tx.send(cmd).await.map_err(|_| StoreError::Closed)
    }

    /// Apply a local mutation, returning the local generation after it
    pub async fn apply_local(&self, mutation: Mutation) -> Result<u64, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::ApplyLocal { mutation, reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Apply generation `generation` of `node`. A gap is rejected and triggers a
    /// full resync request for that node.
    pub async fn apply_remote(&self, node: &str, generation: u64, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::ApplyRemote {
            node: node.to_string(),
            generation,
            mutations,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Hand a decoded heartbeat payload to the store
    pub async fn apply_message(&self, msg: HbMessage) -> Result<(), StoreError> {
        self.send(StoreCmd::ApplyMessage { msg }).await
    }

    pub async fn set_object_agg(
        &self,
        path: ObjectPath,
        value: ObjectStatus,
        src_event: Option<String>,
    ) -> Result<(), StoreError> {
        self.send(StoreCmd::SetObjectAgg { path, value, src_event }).await
    }

    pub async fn del_object_agg(&self, path: ObjectPath) -> Result<(), StoreError> {
        self.send(StoreCmd::DelObjectAgg { path }).await
    }

    /// Deep copy of the tree. Empty `selector`/`namespace` keep everything.
    pub async fn snapshot(&self, selector: &str, namespace: &str) -> Result<ClusterStatus, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::Snapshot {
            selector: selector.to_string(),
            namespace: namespace.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    pub async fn instance(&self, path: &ObjectPath, node: &str) -> Result<Option<Instance>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::GetInstance {
            path: path.clone(),
            node: node.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Current cluster membership
    pub async fn cluster_nodes(&self) -> Result<Vec<String>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::ClusterNodes { reply }).await?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Nodes currently holding a config for `path`
    pub async fn config_nodes(&self, path: &ObjectPath) -> Result<Vec<String>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCmd::ConfigNodes {
            path: path.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::Closed)
    }
}

/// The store actor
pub struct Store {
    data: ClusterData,
    bus: Bus,
    rx: mpsc::Receiver<StoreCmd>,
    outbound: broadcast::Sender<Vec<u8>>,
    interval: Duration,
}

impl Store {
    pub fn new(config: StoreConfig, bus: Bus) -> (Self, StoreHandle) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (outbound, _) = broadcast::channel(16);
        let store = Self {
            data: ClusterData::new(&config.nodename, config.cluster, config.max_patch_queue)
                .with_peer_timeout(config.peer_timeout),
            bus,
            rx,
            outbound,
            interval: config.interval,
        };
        (store, StoreHandle::from_sender(tx))
    }

    /// Sender of encoded outgoing heartbeat payloads, for the transmitters
    pub fn outbound(&self) -> broadcast::Sender<Vec<u8>> {
        self.outbound.clone()
    }

    fn publish(&self, events: Vec<Publication>) {
        for (event, labels) in events {
            self.bus.publish(event, &labels);
        }
    }

    fn handle(&mut self, cmd: StoreCmd) {
        match cmd {
            StoreCmd::ApplyLocal { mutation, reply } => {
                let (generation, events) = self.data.apply_local(mutation);
                self.publish(events);
                let _ = reply.send(generation);
            }
            StoreCmd::ApplyRemote {
                node,
                generation,
                mutations,
                reply,
            } => {
                let result = self.data.apply_remote(&node, generation, &mutations).map(|events| self.publish(events));
                if let Err(err) = &result {
                    tracing::warn!(node = %node, error = %err, "remote patch rejected");
                }
                let pending = self.data.take_pending();
                self.publish(pending);
                let _ = reply.send(result);
            }
            StoreCmd::ApplyMessage { msg } => {
                let events = self.data.apply_message(msg);
                self.publish(events);
            }
            StoreCmd::SetObjectAgg { path, value, src_event } => {
                let events = self.data.set_object_agg(&path, value, src_event);
                self.publish(events);
            }
            StoreCmd::DelObjectAgg { path } => {
                let events = self.data.del_object_agg(&path);
                self.publish(events);
            }
            StoreCmd::Snapshot {
                selector,
                namespace,
                reply,
            } => {
                let _ = reply.send(self.data.snapshot(&selector, &namespace));
            }
            StoreCmd::GetInstance { path, node, reply } => {
                let _ = reply.send(self.data.instance(&path, &node));
            }
            StoreCmd::ClusterNodes { reply } => {
                let _ = reply.send(self.data.cluster_nodes().to_vec());
            }
            StoreCmd::ConfigNodes { path, reply } => {
                let _ = reply.send(self.data.config_nodes(&path));
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::HbStatusUpdated { node, hb_id, to, .. } => {
                self.data.set_hb_stream(&node, &hb_id, to);
            }
            Event::HbModeUpdated { node, to, .. } => {
                self.data.set_hb_mode(&node, to);
            }
            other => {
                tracing::debug!(event = %other.kind(), "store: ignored event");
            }
        }
    }

    fn tick(&mut self) {
        if self.outbound.receiver_count() == 0 {
            return;
        }
        let msg = self.data.build_message();
        match serde_json::to_vec(&msg) {
            Ok(bytes) => {
                tracing::trace!(
                    kind = msg.kind(),
                    generation = msg.generation(),
                    len = bytes.len(),
                    queued = self.data.patch_queue_len(),
                    "outgoing heartbeat"
                );
                let _ = self.outbound.send(bytes);
            }
            Err(e) => {
                tracing::error!(error = %StoreError::from(e), "failed to encode heartbeat message");
            }
        }
    }

    /// Run until `cancel` fires or every handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut hb_status = self.bus.subscribe("store", EventKind::HbStatusUpdated, vec![]);
        let mut hb_mode = self.bus.subscribe("store", EventKind::HbModeUpdated, vec![]);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(node = %self.data.localhost(), generation = self.data.generation(), "store started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(event) = hb_status.recv() => self.on_event(event),
                Some(event) = hb_mode.recv() => self.on_event(event),
                _ = ticker.tick() => self.tick(),
            }
        }

        hb_status.stop();
        hb_mode.stop();
        self.rx.close();
        tracing::info!(generation = self.data.generation(), "store stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Label;
    use warden_common::{InstanceStatus, Status};

    fn start(nodes: &[&str]) -> (StoreHandle, Bus, broadcast::Sender<Vec<u8>>, CancellationToken) {
        let bus = Bus::new(64);
        let (store, handle) = Store::new(
            StoreConfig {
                nodename: "n1".into(),
                cluster: ClusterConfig {
                    name: "c1".into(),
                    nodes: nodes.iter().map(|n| n.to_string()).collect(),
                },
                interval: Duration::from_millis(20),
                peer_timeout: Duration::from_secs(15),
                max_patch_queue: 100,
                queue_size: 16,
            },
            bus.clone(),
        );
        let outbound = store.outbound();
        let cancel = CancellationToken::new();
        tokio::spawn(store.run(cancel.clone()));
        (handle, bus, outbound, cancel)
    }

    fn status(avail: Status) -> Mutation {
        Mutation::SetInstanceStatus {
            path: ObjectPath::parse("web").unwrap(),
            value: InstanceStatus {
                avail,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_apply_local_publishes_and_snapshots() {
        let (store, bus, _outbound, cancel) = start(&["n1"]);
        let mut sub = bus.subscribe("t", EventKind::InstanceStatusUpdated, vec![Label::path("web")]);

        let generation = store.apply_local(status(Status::Up)).await.unwrap();
        assert_eq!(generation, INITIAL_GEN + 1);

        match sub.recv().await.unwrap() {
            Event::InstanceStatusUpdated { node, value, .. } => {
                assert_eq!(node, "n1");
                assert_eq!(value.avail, Status::Up);
            }
            other => panic!("unexpected {other:?}"),
        }

        let snap = store.snapshot("", "").await.unwrap();
        assert_eq!(snap.nodes["n1"].generation, generation);
        assert_eq!(snap.daemon.gens["n1"], generation);
        assert!(store.snapshot("db*", "").await.unwrap().nodes["n1"].instances.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_apply_remote_gap_requests_full() {
        let (store, bus, _outbound, cancel) = start(&["n1", "n2"]);
        let mut resync = bus.subscribe("t", EventKind::FullResyncRequested, vec![]);

        store
            .apply_message(HbMessage::Full {
                nodename: "n2".into(),
                generation: 3,
                gens: Gens::new(),
                data: Default::default(),
            })
            .await
            .unwrap();
        store.apply_remote("n2", 4, vec![status(Status::Up)]).await.unwrap();

        let err = store.apply_remote("n2", 6, vec![status(Status::Down)]).await.unwrap_err();
        assert!(matches!(err, StoreError::GenerationGap { received: 6, .. }));

        match resync.recv().await.unwrap() {
            Event::FullResyncRequested {
                node,
                last_applied,
                received,
            } => assert_eq!((node.as_str(), last_applied, received), ("n2", 4, 6)),
            other => panic!("unexpected {other:?}"),
        }

        let web = ObjectPath::parse("web").unwrap();
        let inst = store.instance(&web, "n2").await.unwrap().unwrap();
        assert_eq!(inst.status.unwrap().avail, Status::Up);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tick_emits_encoded_message() {
        let (_store, _bus, outbound, cancel) = start(&["n1", "n2"]);
        let mut rx = outbound.subscribe();
        let bytes = rx.recv().await.unwrap();
        let msg: HbMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg.nodename(), "n1");
        assert_eq!(msg.generation(), INITIAL_GEN);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cluster_nodes_follow_local_cluster_config() {
        let (store, _bus, _outbound, cancel) = start(&["n1"]);
        assert_eq!(store.cluster_nodes().await.unwrap(), vec!["n1"]);

        store
            .apply_local(Mutation::SetInstanceConfig {
                path: ObjectPath::cluster(),
                value: warden_common::InstanceConfig {
                    scope: vec!["n1".into(), "n2".into()],
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(store.cluster_nodes().await.unwrap(), vec!["n1", "n2"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_closed_store() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = StoreHandle::from_sender(tx);
        assert!(matches!(handle.snapshot("", "").await, Err(StoreError::Closed)));
    }
}
