use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use warden_common::Instance;

use crate::bus::Bus;
use crate::config::AppConfig;
use crate::state::AppState;
use crate::store::{Mutation, StoreCmd, StoreHandle};

pub fn test_ctx(nodename: &str, store_tx: mpsc::Sender<StoreCmd>) -> AppState {
    let config = AppConfig {
        nodename: nodename.to_string(),
        ..Default::default()
    };
    AppState::new(config, Bus::new(64), StoreHandle::from_sender(store_tx), CancellationToken::new())
}

/// Answers store commands from a fixed set of instances (keyed by
/// `path@node`) and forwards every local mutation and aggregate command
pub fn fake_store(
    mut rx: mpsc::Receiver<StoreCmd>,
    instances: HashMap<String, Instance>,
) -> mpsc::UnboundedReceiver<StoreCmd> {
    let (tx, out) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                StoreCmd::ApplyLocal { mutation, reply } => {
                    let _ = reply.send(1);
                    let (dummy, _) = tokio::sync::oneshot::channel();
                    let _ = tx.send(StoreCmd::ApplyLocal { mutation, reply: dummy });
                }
                StoreCmd::GetInstance { path, node, reply } => {
                    let _ = reply.send(instances.get(&format!("{path}@{node}")).cloned());
                }
                StoreCmd::Snapshot { reply, .. } => {
                    let _ = reply.send(Default::default());
                }
                StoreCmd::ClusterNodes { reply } | StoreCmd::ConfigNodes { reply, .. } => {
                    let _ = reply.send(Vec::new());
                }
                other => {
                    let _ = tx.send(other);
                }
            }
        }
    });
    out
}

/// Next forwarded local mutation
pub async fn next_mutation(out: &mut mpsc::UnboundedReceiver<StoreCmd>) -> Mutation {
    loop {
        match out.recv().await {
            Some(StoreCmd::ApplyLocal { mutation, .. }) => return mutation,
            Some(_) => continue,
            None => panic!("fake store closed"),
        }
    }
}
