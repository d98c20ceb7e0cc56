//! Peer liveness controller.
//!
//! Tracks one state per (peer node, driver stream) pair:
//!
//! ```text
//! Unknown --success--> Alive --timeout--> Stale --success--> Alive
//! ```
//!
//! A node is in `patch` mode while at least one of its receive streams is
//! alive, `full` otherwise. A transmit stream going alive only says our
//! datagrams left. State and mode transitions are published on the bus.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use warden_common::{HbMode, PeerState};

use crate::bus::{Bus, Event, Label};
use crate::store::Publication;

/// Half of a heartbeat driver a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Debug)]
pub enum CtrlCmd {
    /// A driver stream starts watching `node`
    Register {
        node: String,
        hb_id: String,
        direction: Direction,
    },
    /// A driver stream stopped; forget its watchers
    Unregister { hb_id: String },
    /// A successful exchange with `node` on `hb_id`
    Success {
        node: String,
        hb_id: String,
        direction: Direction,
    },
}

#[derive(Clone)]
pub struct PeerCtrlHandle {
    tx: mpsc::Sender<CtrlCmd>,
}

impl PeerCtrlHandle {
    pub fn from_sender(tx: mpsc::Sender<CtrlCmd>) -> Self {
        Self { tx }
    }

    pub async fn register(&self, node: &str, hb_id: &str, direction: Direction) {
        self.send(CtrlCmd::Register {
            node: node.to_string(),
            hb_id: hb_id.to_string(),
            direction,
        })
        .await;
    }

    pub async fn unregister(&self, hb_id: &str) {
        self.send(CtrlCmd::Unregister {
            hb_id: hb_id.to_string(),
        })
        .await;
    }

    pub async fn success(&self, node: &str, hb_id: &str, direction: Direction) {
        self.send(CtrlCmd::Success {
            node: node.to_string(),
            hb_id: hb_id.to_string(),
            direction,
        })
        .await;
    }

    async fn send(&self, cmd: CtrlCmd) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("peer controller is gone");
        }
    }
}

struct Watcher {
    direction: Direction,
    state: PeerState,
    deadline: Option<Instant>,
}

impl Watcher {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: PeerState::Unknown,
            deadline: None,
        }
    }
}

/// Liveness bookkeeping, free of any I/O
pub struct PeerTable {
    localhost: String,
    timeout: Duration,
    watchers: BTreeMap<(String, String), Watcher>,
    modes: BTreeMap<String, HbMode>,
}

impl PeerTable {
    pub fn new(localhost: &str, timeout: Duration) -> Self {
        Self {
            localhost: localhost.to_string(),
            timeout,
            watchers: BTreeMap::new(),
            modes: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self, node: &str, hb_id: &str) -> Option<PeerState> {
        self.watchers
            .get(&(node.to_string(), hb_id.to_string()))
            .map(|w| w.state)
    }

    #[cfg(test)]
    pub fn mode(&self, node: &str) -> HbMode {
        self.modes.get(node).copied().unwrap_or_default()
    }

    pub fn register(&mut self, node: &str, hb_id: &str, direction: Direction) -> Vec<Publication> {
        if node == self.localhost {
            return Vec::new();
        }
        self.watchers
            .entry((node.to_string(), hb_id.to_string()))
            .or_insert_with(|| Watcher::new(direction));
        self.refresh_modes()
    }

    pub fn unregister(&mut self, hb_id: &str) -> Vec<Publication> {
        self.watchers.retain(|(_, id), _| id != hb_id);
        self.refresh_modes()
    }

    pub fn success(&mut self, node: &str, hb_id: &str, direction: Direction, now: Instant) -> Vec<Publication> {
        if node == self.localhost {
            return Vec::new();
        }
        let watcher = self
            .watchers
            .entry((node.to_string(), hb_id.to_string()))
            .or_insert_with(|| Watcher::new(direction));
        watcher.deadline = Some(now + self.timeout);
        let from = watcher.state;
        if from == PeerState::Alive {
            return Vec::new();
        }
        watcher.state = PeerState::Alive;
        tracing::info!(node = %node, hb_id = %hb_id, from = ?from, "peer alive");

        let mut events = vec![status_event(node, hb_id, from, PeerState::Alive)];
        events.extend(self.refresh_modes());
        events
    }

    /// Mark stale every alive stream whose deadline has passed
    pub fn check(&mut self, now: Instant) -> Vec<Publication> {
        let mut events = Vec::new();
        for ((node, hb_id), watcher) in self.watchers.iter_mut() {
            if watcher.state != PeerState::Alive {
                continue;
            }
            if watcher.deadline.is_some_and(|d| now >= d) {
                watcher.state = PeerState::Stale;
                tracing::warn!(node = %node, hb_id = %hb_id, "peer stale");
                events.push(status_event(node, hb_id, PeerState::Alive, PeerState::Stale));
            }
        }
        if !events.is_empty() {
            events.extend(self.refresh_modes());
        }
        events
    }

    fn refresh_modes(&mut self) -> Vec<Publication> {
        let mut computed: BTreeMap<String, HbMode> = BTreeMap::new();
        for ((node, _), watcher) in &self.watchers {
            let mode = computed.entry(node.clone()).or_default();
            if watcher.direction == Direction::Rx && watcher.state == PeerState::Alive {
                *mode = HbMode::Patch;
            }
        }

        let joined: Vec<String> = computed
            .iter()
            .filter(|(_, m)| **m == HbMode::Patch)
            .map(|(n, _)| n.clone())
            .collect();

        let nodes: BTreeSet<String> = computed.keys().chain(self.modes.keys()).cloned().collect();
        let mut events = Vec::new();
        for node in nodes {
            let from = self.modes.get(&node).copied();
            let to = computed.get(&node).copied();
            match (from, to) {
                (Some(from), Some(to)) if from == to => {}
                (from, Some(to)) => {
                    let from = from.unwrap_or_default();
                    if from != to {
                        tracing::info!(node = %node, from = ?from, to = ?to, "peer mode changed");
                        events.push((
                            Event::HbModeUpdated {
                                node: node.clone(),
                                from,
                                to,
                                joined_nodes: joined.clone(),
                            },
                            vec![Label::node(&node)],
                        ));
                    }
                }
                (Some(HbMode::Patch), None) => {
                    events.push((
                        Event::HbModeUpdated {
                            node: node.clone(),
                            from: HbMode::Patch,
                            to: HbMode::Full,
                            joined_nodes: joined.clone(),
                        },
                        vec![Label::node(&node)],
                    ));
                }
                _ => {}
            }
        }
        self.modes = computed;
        events
    }
}

fn status_event(node: &str, hb_id: &str, from: PeerState, to: PeerState) -> Publication {
    (
        Event::HbStatusUpdated {
            node: node.to_string(),
            hb_id: hb_id.to_string(),
            from,
            to,
        },
        vec![Label::node(node)],
    )
}

/// The controller actor
pub struct PeerCtrl {
    table: PeerTable,
    bus: Bus,
    rx: mpsc::Receiver<CtrlCmd>,
    check_interval: Duration,
}

impl PeerCtrl {
    pub fn new(localhost: &str, timeout: Duration, check_interval: Duration, bus: Bus) -> (Self, PeerCtrlHandle) {
        let (tx, rx) = mpsc::channel(256);
        let ctrl = Self {
            table: PeerTable::new(localhost, timeout),
            bus,
            rx,
            check_interval,
        };
        (ctrl, PeerCtrlHandle::from_sender(tx))
    }

    fn publish(&self, events: Vec<Publication>) {
        for (event, labels) in events {
            self.bus.publish(event, &labels);
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!("peer controller started");

        loop {
            let events = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(CtrlCmd::Register { node, hb_id, direction }) => self.table.register(&node, &hb_id, direction),
                    Some(CtrlCmd::Unregister { hb_id }) => self.table.unregister(&hb_id),
                    Some(CtrlCmd::Success { node, hb_id, direction }) => {
                        self.table.success(&node, &hb_id, direction, Instant::now())
                    }
                    None => break,
                },
                _ = ticker.tick() => self.table.check(Instant::now()),
            };
            self.publish(events);
        }

        self.rx.close();
        tracing::debug!("peer controller stopped");
    }
}
