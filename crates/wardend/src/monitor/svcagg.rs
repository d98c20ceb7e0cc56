//! Object status aggregator.
//!
//! One per object known to the cluster. Tracks the instance status and
//! monitor of every node hosting the object and republishes the folded
//! [`ObjectStatus`] on each change.

use std::collections::BTreeMap;
use tokio::sync::mpsc;

use warden_common::{Frozen, InstanceMonitor, InstanceStatus, ObjectPath, ObjectStatus, Placement, Provisioned, Status};

use super::{WorkerCmd, WorkerHandle};
use crate::bus::{self, Event, EventKind, Label};
use crate::discover::DiscoverCmd;
use crate::state::AppState;

/// Fold per-node records into the object status.
///
/// Pure and independent of node order: the maps are only ever read as sets.
pub fn aggregate(
    status: &BTreeMap<String, InstanceStatus>,
    monitors: &BTreeMap<String, InstanceMonitor>,
) -> ObjectStatus {
    let avail = avail_vote(status.values().map(|s| s.avail));

    let overall = if avail == Status::Warn {
        Status::Warn
    } else {
        status.values().fold(Status::Undef, |acc, s| acc.add(s.overall))
    };

    let provisioned = status.values().fold(Provisioned::Undef, |acc, s| acc.and(s.provisioned));

    let frozen = if status.is_empty() {
        Frozen::NotApplicable
    } else if status.values().all(InstanceStatus::is_frozen) {
        Frozen::Frozen
    } else if !status.values().any(InstanceStatus::is_frozen) {
        Frozen::Thawed
    } else {
        Frozen::Mixed
    };

    ObjectStatus {
        avail,
        overall,
        provisioned,
        frozen,
        placement: placement(status, monitors),
    }
}

fn avail_vote(values: impl Iterator<Item = Status>) -> Status {
    let (mut warn, mut up, mut down) = (false, false, false);
    for value in values {
        match value {
            Status::Warn => warn = true,
            Status::Up => up = true,
            Status::Down => down = true,
            _ => {}
        }
    }
    if warn {
        Status::Warn
    } else if up {
        Status::Up
    } else if down {
        Status::Down
    } else {
        Status::Undef
    }
}

fn placement(status: &BTreeMap<String, InstanceStatus>, monitors: &BTreeMap<String, InstanceMonitor>) -> Placement {
    let mut placement = Placement::NotApplicable;
    for (node, monitor) in monitors {
        // a node without status yet has no say
        let Some(instance) = status.get(node) else {
            continue;
        };
        let expected: &[Status] = if monitor.is_leader {
            &[Status::Up, Status::NotApplicable]
        } else {
            &[Status::Down, Status::NotApplicable]
        };
        if !instance.avail.is(expected) {
            return Placement::NonOptimal;
        }
        placement = Placement::Optimal;
    }
    placement
}

/// Start aggregating `path` over the nodes of `scope`
pub fn start(ctx: &AppState, path: ObjectPath, scope: Vec<String>, discover: mpsc::Sender<DiscoverCmd>) -> WorkerHandle {
    let (tx, cmd_rx) = mpsc::channel(8);
    let handle = WorkerHandle::new(tx);
    let worker = SvcAgg {
        ctx: ctx.clone(),
        id: handle.id(),
        path,
        status: BTreeMap::new(),
        monitors: BTreeMap::new(),
        cmd_rx,
    };
    tokio::spawn(worker.run(scope, discover));
    handle
}

struct SvcAgg {
    ctx: AppState,
    id: u64,
    path: ObjectPath,

    /// Tracked nodes are the keys of this map
    status: BTreeMap<String, InstanceStatus>,
    monitors: BTreeMap<String, InstanceMonitor>,

    cmd_rx: mpsc::Receiver<WorkerCmd>,
}

impl SvcAgg {
    async fn run(mut self, scope: Vec<String>, discover: mpsc::Sender<DiscoverCmd>) {
        let cancel = self.ctx.cancel.child_token();
        let name = format!("{} svcagg", self.path);
        let by_path = vec![Label::path(&self.path)];
        let bus = self.ctx.bus.clone();
        let mut sub_status = bus.subscribe(&name, EventKind::InstanceStatusUpdated, by_path.clone());
        let mut sub_monitor = bus.subscribe(&name, EventKind::InstanceMonitorUpdated, by_path.clone());
        let mut sub_cfg = bus.subscribe(&name, EventKind::ConfigUpdated, by_path.clone());
        let mut sub_cfg_del = bus.subscribe(&name, EventKind::ConfigDeleted, by_path);

        for node in &scope {
            self.track(node).await;
        }
        tracing::info!(path = %self.path, nodes = ?scope, "aggregator started");

        if !self.status.is_empty() {
            self.publish(None).await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(cmd) = self.cmd_rx.recv() => match cmd {
                        WorkerCmd::Exit => break,
                        other => tracing::error!(path = %self.path, cmd = ?other, "unexpected command"),
                    },
                    Some(event) = sub_cfg_del.recv() => {
                        if let Event::ConfigDeleted { node, .. } = &event {
                            if self.status.remove(node).is_none() {
                                continue;
                            }
                            self.monitors.remove(node);
                            tracing::debug!(path = %self.path, node = %node, "node left");
                        }
                        if self.status.is_empty() {
                            break;
                        }
                        self.publish(Some(event.describe())).await;
                    }
                    Some(event) = sub_cfg.recv() => {
                        if let Event::ConfigUpdated { node, .. } = &event {
                            if self.status.contains_key(node) {
                                continue;
                            }
                            self.track(node).await;
                            tracing::debug!(path = %self.path, node = %node, "node joined");
                        }
                        self.publish(Some(event.describe())).await;
                    }
                    Some(event) = sub_status.recv() => {
                        if let Event::InstanceStatusUpdated { node, value, .. } = &event {
                            match self.status.get_mut(node) {
                                Some(status) => *status = value.clone(),
                                None => continue,
                            }
                        }
                        self.publish(Some(event.describe())).await;
                    }
                    Some(event) = sub_monitor.recv() => {
                        if let Event::InstanceMonitorUpdated { node, value, .. } = &event {
                            if !self.status.contains_key(node) {
                                continue;
                            }
                            self.monitors.insert(node.clone(), value.clone());
                        }
                        self.publish(Some(event.describe())).await;
                    }
                }
            }
        }

        sub_status.stop();
        sub_monitor.stop();
        sub_cfg.stop();
        sub_cfg_del.stop();
        if let Err(e) = self.ctx.store.del_object_agg(self.path.clone()).await {
            tracing::debug!(path = %self.path, error = %e, "failed to delete aggregate");
        }
        let dropped = bus::drop_pending(&mut self.cmd_rx, self.ctx.config.worker.drop_pending_timeout()).await;
        if dropped > 0 {
            tracing::debug!(path = %self.path, dropped, "dropped pending commands");
        }
        let done = DiscoverCmd::AggDone {
            path: self.path.clone(),
            worker: self.id,
        };
        if discover.send(done).await.is_err() {
            tracing::debug!(path = %self.path, "discovery already gone");
        }
        tracing::info!(path = %self.path, "aggregator stopped");
    }

    /// Start tracking `node`, seeded from the store
    async fn track(&mut self, node: &str) {
        let instance = match self.ctx.store.instance(&self.path, node).await {
            Ok(instance) => instance.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %self.path, node = %node, error = %e, "failed to read instance");
                Default::default()
            }
        };
        self.status.insert(node.to_string(), instance.status.unwrap_or_default());
        self.monitors.insert(node.to_string(), instance.monitor.unwrap_or_default());
    }

    async fn publish(&self, src_event: Option<String>) {
        let value = aggregate(&self.status, &self.monitors);
        tracing::trace!(path = %self.path, avail = %value.avail, overall = %value.overall, src = ?src_event, "aggregate updated");
        if let Err(e) = self.ctx.store.set_object_agg(self.path.clone(), value, src_event).await {
            tracing::warn!(path = %self.path, error = %e, "failed to publish aggregate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testutil::{fake_store, test_ctx};
    use crate::store::StoreCmd;
    use std::collections::HashMap;
    use std::time::Duration;
    use warden_common::{Instance, InstanceConfig};

    fn status(avail: Status) -> InstanceStatus {
        InstanceStatus {
            avail,
            overall: avail,
            ..Default::default()
        }
    }

    fn nodes<T: Clone>(values: &[(&str, T)]) -> BTreeMap<String, T> {
        values.iter().map(|(n, v)| (n.to_string(), v.clone())).collect()
    }

    fn leader(is_leader: bool) -> InstanceMonitor {
        InstanceMonitor {
            is_leader,
            ..Default::default()
        }
    }

    #[test]
    fn test_avail_vote() {
        let none = BTreeMap::new();
        let up_down = nodes(&[("n1", status(Status::Up)), ("n2", status(Status::Down))]);
        assert_eq!(aggregate(&up_down, &none).avail, Status::Up);

        let warn_up = nodes(&[("n1", status(Status::Warn)), ("n2", status(Status::Up))]);
        let agg = aggregate(&warn_up, &none);
        assert_eq!(agg.avail, Status::Warn);
        assert_eq!(agg.overall, Status::Warn);

        let empty = aggregate(&BTreeMap::new(), &none);
        assert_eq!(empty.avail, Status::Undef);
        assert_eq!(empty.frozen, Frozen::NotApplicable);
        assert_eq!(empty.placement, Placement::NotApplicable);
    }

    #[test]
    fn test_placement() {
        let st = nodes(&[("n1", status(Status::Up)), ("n2", status(Status::Down))]);
        let mons = nodes(&[("n1", leader(true)), ("n2", leader(false))]);
        assert_eq!(aggregate(&st, &mons).placement, Placement::Optimal);

        let st = nodes(&[("n1", status(Status::Down)), ("n2", status(Status::Up))]);
        assert_eq!(aggregate(&st, &mons).placement, Placement::NonOptimal);

        let st = nodes(&[("n1", status(Status::Down))]);
        let mons = nodes(&[("n1", leader(true))]);
        assert_eq!(aggregate(&st, &mons).placement, Placement::NonOptimal);
    }

    #[test]
    fn test_frozen_and_provisioned() {
        let frozen = InstanceStatus {
            frozen: Some(chrono::Utc::now()),
            provisioned: Provisioned::True,
            ..Default::default()
        };
        let thawed = InstanceStatus {
            provisioned: Provisioned::False,
            ..Default::default()
        };
        let none = BTreeMap::new();
        assert_eq!(aggregate(&nodes(&[("n1", frozen.clone())]), &none).frozen, Frozen::Frozen);
        assert_eq!(aggregate(&nodes(&[("n1", thawed.clone())]), &none).frozen, Frozen::Thawed);

        let mixed = aggregate(&nodes(&[("n1", frozen), ("n2", thawed)]), &none);
        assert_eq!(mixed.frozen, Frozen::Mixed);
        assert_eq!(mixed.provisioned, Provisioned::Mixed);
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let a = nodes(&[
            ("n1", status(Status::Up)),
            ("n2", status(Status::Down)),
            ("n3", status(Status::NotApplicable)),
        ]);
        let mons = nodes(&[("n1", leader(true)), ("n2", leader(false)), ("n3", leader(false))]);
        let first = aggregate(&a, &mons);
        assert_eq!(first, aggregate(&a, &mons));

        // same content inserted in reverse order
        let mut b = BTreeMap::new();
        for (k, v) in a.iter().rev() {
            b.insert(k.clone(), v.clone());
        }
        assert_eq!(first, aggregate(&b, &mons));
        assert_eq!(first.overall, Status::Warn);
    }

    async fn next_agg(out: &mut mpsc::UnboundedReceiver<StoreCmd>) -> StoreCmd {
        loop {
            match out.recv().await {
                Some(cmd @ (StoreCmd::SetObjectAgg { .. } | StoreCmd::DelObjectAgg { .. })) => return cmd,
                Some(_) => continue,
                None => panic!("fake store closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_worker_tracks_and_deletes_once() {
        let path = ObjectPath::parse("web").unwrap();
        let mut instances = HashMap::new();
        instances.insert(
            "web@n2".to_string(),
            Instance {
                status: Some(status(Status::Down)),
                ..Default::default()
            },
        );
        let (store_tx, store_rx) = mpsc::channel(16);
        let mut out = fake_store(store_rx, instances);
        let ctx = test_ctx("n1", store_tx);
        let (discover_tx, mut discover_rx) = mpsc::channel(4);
        let _handle = start(&ctx, path.clone(), vec!["n1".into(), "n2".into()], discover_tx);

        match next_agg(&mut out).await {
            StoreCmd::SetObjectAgg { value, src_event, .. } => {
                assert_eq!(value.avail, Status::Down);
                assert_eq!(src_event, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        let labels = |node: &str| vec![Label::path(&path), Label::node(node)];
        ctx.bus.publish(
            Event::InstanceStatusUpdated {
                path: path.clone(),
                node: "n1".into(),
                value: status(Status::Up),
            },
            &labels("n1"),
        );
        match next_agg(&mut out).await {
            StoreCmd::SetObjectAgg { value, src_event, .. } => {
                assert_eq!(value.avail, Status::Up);
                assert_eq!(src_event.as_deref(), Some("InstanceStatusUpdated@n1"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // not tracked: ignored
        ctx.bus.publish(
            Event::InstanceStatusUpdated {
                path: path.clone(),
                node: "n9".into(),
                value: status(Status::Warn),
            },
            &labels("n9"),
        );
        assert!(tokio::time::timeout(Duration::from_millis(100), out.recv()).await.is_err());

        // a newly configured node joins
        ctx.bus.publish(
            Event::ConfigUpdated {
                path: path.clone(),
                node: "n3".into(),
                value: InstanceConfig::default(),
            },
            &labels("n3"),
        );
        assert!(matches!(next_agg(&mut out).await, StoreCmd::SetObjectAgg { .. }));

        for node in ["n1", "n2", "n3"] {
            ctx.bus.publish(
                Event::ConfigDeleted {
                    path: path.clone(),
                    node: node.into(),
                },
                &labels(node),
            );
        }
        assert!(matches!(next_agg(&mut out).await, StoreCmd::SetObjectAgg { .. }));
        assert!(matches!(next_agg(&mut out).await, StoreCmd::SetObjectAgg { .. }));
        assert!(matches!(next_agg(&mut out).await, StoreCmd::DelObjectAgg { .. }));

        match discover_rx.recv().await {
            Some(DiscoverCmd::AggDone { path: done, .. }) => assert_eq!(done, path),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tokio::time::timeout(Duration::from_millis(200), discover_rx.recv()).await.ok().flatten().is_none());
    }
}
