//! Instance monitor collaborator.
//!
//! The orchestration state machine itself lives outside this daemon. The
//! [`PassiveMonitor`] keeps the local monitor record present and applies
//! operator requests (abort, clear) to it, nothing more.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use warden_common::{InstanceMonitor, ObjectPath};

use crate::bus::{Event, EventKind, Label};
use crate::state::AppState;
use crate::store::Mutation;

/// Starts the monitor of one object; the returned task ends when the
/// monitor does
pub trait MonitorStarter: Send + Sync {
    fn start(&self, ctx: AppState, path: ObjectPath, scope: Vec<String>, cancel: CancellationToken) -> JoinHandle<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveMonitor;

impl MonitorStarter for PassiveMonitor {
    fn start(&self, ctx: AppState, path: ObjectPath, scope: Vec<String>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run(ctx, path, scope, cancel))
    }
}

fn is_leader(scope: &[String], localhost: &str) -> bool {
    scope.first().is_some_and(|n| n == localhost)
}

async fn run(ctx: AppState, path: ObjectPath, scope: Vec<String>, cancel: CancellationToken) {
    let name = format!("{path} smon");
    let filter = vec![Label::path(&path), Label::node(&ctx.nodename)];
    let mut sub_set = ctx.bus.subscribe(&name, EventKind::SetInstanceMonitor, filter.clone());
    let mut sub_cfg = ctx.bus.subscribe(&name, EventKind::ConfigUpdated, filter);

    let mut monitor = match ctx.store.instance(&path, &ctx.nodename).await {
        Ok(Some(instance)) => instance.monitor.unwrap_or_default(),
        _ => InstanceMonitor::default(),
    };
    monitor.is_leader = is_leader(&scope, &ctx.nodename);
    publish(&ctx, &path, &monitor).await;
    tracing::debug!(path = %path, leader = monitor.is_leader, "monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = sub_set.recv() => {
                if let Event::SetInstanceMonitor { value, .. } = event {
                    if monitor.apply(&value, Utc::now()) {
                        tracing::info!(path = %path, global_expect = ?monitor.global_expect, state = ?monitor.state, "monitor updated");
                        publish(&ctx, &path, &monitor).await;
                    }
                }
            }
            Some(event) = sub_cfg.recv() => {
                if let Event::ConfigUpdated { value, .. } = event {
                    let leader = is_leader(&value.scope, &ctx.nodename);
                    if leader != monitor.is_leader {
                        monitor.is_leader = leader;
                        publish(&ctx, &path, &monitor).await;
                    }
                }
            }
        }
    }

    sub_set.stop();
    sub_cfg.stop();
    if let Err(e) = ctx.store.apply_local(Mutation::DelInstanceMonitor { path: path.clone() }).await {
        tracing::debug!(path = %path, error = %e, "failed to delete monitor");
    }
    tracing::debug!(path = %path, "monitor stopped");
}

async fn publish(ctx: &AppState, path: &ObjectPath, monitor: &InstanceMonitor) {
    let mutation = Mutation::SetInstanceMonitor {
        path: path.clone(),
        value: monitor.clone(),
    };
    if let Err(e) = ctx.store.apply_local(mutation).await {
        tracing::warn!(path = %path, error = %e, "failed to publish monitor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testutil::{fake_store, next_mutation, test_ctx};
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use warden_common::{GlobalExpect, MonitorUpdate};

    #[tokio::test]
    async fn test_seed_apply_and_delete() {
        let (store_tx, store_rx) = mpsc::channel(8);
        let mut out = fake_store(store_rx, HashMap::new());
        let ctx = test_ctx("n1", store_tx);
        let path = ObjectPath::parse("web").unwrap();
        let cancel = CancellationToken::new();
        let task = PassiveMonitor.start(ctx.clone(), path.clone(), vec!["n1".into(), "n2".into()], cancel.clone());

        match next_mutation(&mut out).await {
            Mutation::SetInstanceMonitor { value, .. } => assert!(value.is_leader),
            other => panic!("unexpected {other:?}"),
        }

        ctx.bus.publish(
            Event::SetInstanceMonitor {
                path: path.clone(),
                node: "n1".into(),
                value: MonitorUpdate {
                    global_expect: Some(GlobalExpect::Aborted),
                    state: None,
                },
            },
            &[Label::path(&path), Label::node("n1"), Label::new("from", "api")],
        );
        match next_mutation(&mut out).await {
            Mutation::SetInstanceMonitor { value, .. } => assert_eq!(value.global_expect, GlobalExpect::Aborted),
            other => panic!("unexpected {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(next_mutation(&mut out).await, Mutation::DelInstanceMonitor { .. }));
    }

    #[tokio::test]
    async fn test_not_leader_when_not_first_in_scope() {
        let (store_tx, store_rx) = mpsc::channel(8);
        let mut out = fake_store(store_rx, HashMap::new());
        let ctx = test_ctx("n2", store_tx);
        let cancel = CancellationToken::new();
        let task = PassiveMonitor.start(ctx, ObjectPath::parse("web").unwrap(), vec!["n1".into(), "n2".into()], cancel.clone());

        match next_mutation(&mut out).await {
            Mutation::SetInstanceMonitor { value, .. } => assert!(!value.is_leader),
            other => panic!("unexpected {other:?}"),
        }
        cancel.cancel();
        task.await.unwrap();
    }
}
