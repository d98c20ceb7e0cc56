//! Instance config watcher.
//!
//! One per local configuration file. Publishes the local instance config
//! (scope, checksum, mtime) whenever the file content or the cluster
//! membership changes, starts the instance monitor, and cleans the local
//! instance records up when it ends.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

use warden_common::{InstanceConfig, ObjectPath};

use super::configurer::Configurer;
use super::smon::MonitorStarter;
use super::{CheckError, WorkerCmd, WorkerHandle};
use crate::bus::{self, Event, EventKind, Label, Subscription};
use crate::discover::DiscoverCmd;
use crate::state::AppState;
use crate::store::Mutation;

/// Start watching `filename`, the configuration file of `path`
pub fn start(
    ctx: &AppState,
    path: ObjectPath,
    filename: PathBuf,
    configurer: Arc<dyn Configurer>,
    monitor: Arc<dyn MonitorStarter>,
    discover: mpsc::Sender<DiscoverCmd>,
) -> WorkerHandle {
    let (tx, cmd_rx) = mpsc::channel(8);
    let name = format!("{path} instcfg");
    let by_path = vec![Label::path(&path)];

    // subscribe before spawning so no file event is missed
    let subs = Subs {
        updated: ctx.bus.subscribe(&name, EventKind::CfgFileUpdated, by_path.clone()),
        removed: ctx.bus.subscribe(&name, EventKind::CfgFileRemoved, by_path),
        cluster: (!path.is_cluster()).then(|| {
            ctx.bus
                .subscribe(&name, EventKind::ClusterConfigUpdated, vec![Label::node(&ctx.nodename)])
        }),
    };

    let handle = WorkerHandle::new(tx);
    let worker = InstCfg {
        ctx: ctx.clone(),
        id: handle.id(),
        path,
        filename,
        configurer,
        cluster_nodes: Vec::new(),
        cfg: InstanceConfig::default(),
        last_mtime: None,
        force_refresh: false,
        published: false,
        cmd_rx,
    };
    tokio::spawn(worker.run(subs, monitor, discover));
    handle
}

struct Subs {
    updated: Subscription,
    removed: Subscription,
    /// Membership changes of the local node, absent for the cluster object
    cluster: Option<Subscription>,
}

impl Subs {
    fn stop(&mut self) {
        self.updated.stop();
        self.removed.stop();
        if let Some(sub) = self.cluster.as_mut() {
            sub.stop();
        }
    }
}

async fn recv_opt(sub: &mut Option<Subscription>) -> Option<Event> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

struct InstCfg {
    ctx: AppState,
    id: u64,
    path: ObjectPath,
    filename: PathBuf,
    configurer: Arc<dyn Configurer>,
    /// Membership the scope is evaluated against
    cluster_nodes: Vec<String>,

    /// Last published config
    cfg: InstanceConfig,
    last_mtime: Option<SystemTime>,
    force_refresh: bool,
    published: bool,

    cmd_rx: mpsc::Receiver<WorkerCmd>,
}

impl InstCfg {
    async fn run(mut self, mut subs: Subs, monitor: Arc<dyn MonitorStarter>, discover: mpsc::Sender<DiscoverCmd>) {
        let cancel = self.ctx.cancel.child_token();

        match self.ctx.store.cluster_nodes().await {
            Ok(nodes) => self.cluster_nodes = nodes,
            Err(e) => tracing::warn!(path = %self.path, error = %e, "failed to read cluster membership"),
        }
        if let Err(e) = self.check().await {
            tracing::warn!(path = %self.path, error = %e, "initial config check failed");
            self.finish(&mut subs, &discover).await;
            return;
        }

        let mon_cancel = cancel.child_token();
        let mut mon = monitor.start(self.ctx.clone(), self.path.clone(), self.cfg.scope.clone(), mon_cancel.clone());
        let mut mon_done = false;
        tracing::info!(path = %self.path, scope = ?self.cfg.scope, "watching config");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = &mut mon => {
                    mon_done = true;
                    if let Err(e) = res {
                        tracing::error!(path = %self.path, error = %e, "monitor task failed");
                    } else {
                        tracing::warn!(path = %self.path, "monitor ended");
                    }
                    break;
                }
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    WorkerCmd::Exit => break,
                    WorkerCmd::Refresh => {
                        self.force_refresh = true;
                        if let Err(e) = self.check().await {
                            tracing::info!(path = %self.path, error = %e, "config check ended the watcher");
                            break;
                        }
                    }
                },
                Some(_) = subs.removed.recv() => {
                    tracing::info!(path = %self.path, "config file removed");
                    break;
                }
                Some(_) = subs.updated.recv() => {
                    if let Err(e) = self.check().await {
                        tracing::info!(path = %self.path, error = %e, "config check ended the watcher");
                        break;
                    }
                }
                Some(event) = recv_opt(&mut subs.cluster) => {
                    if let Event::ClusterConfigUpdated { value, .. } = event {
                        tracing::debug!(path = %self.path, nodes = ?value.nodes, "cluster membership changed");
                        self.cluster_nodes = value.nodes;
                    }
                    self.force_refresh = true;
                    if let Err(e) = self.check().await {
                        tracing::info!(path = %self.path, error = %e, "config check ended the watcher");
                        break;
                    }
                }
            }
        }

        mon_cancel.cancel();
        if !mon_done {
            let _ = mon.await;
        }
        self.delete().await;
        self.finish(&mut subs, &discover).await;
    }

    /// Re-evaluate the file. An error means the watcher must end.
    async fn check(&mut self) -> Result<(), CheckError> {
        let mtime = self.mtime().await?;
        if self.last_mtime == Some(mtime) && !self.force_refresh {
            tracing::trace!(path = %self.path, "mtime unchanged");
            return Ok(());
        }
        self.force_refresh = false;

        let content = tokio::fs::read(&self.filename)
            .await
            .map_err(|_| CheckError::NoFile(self.filename.clone()))?;
        let checksum = const_hex::encode(Md5::digest(&content));

        let scope = self
            .configurer
            .scope(&self.path, &self.filename, &self.ctx.nodename, &self.cluster_nodes)?;
        if scope.is_empty() {
            return Err(CheckError::EmptyScope);
        }

        if self.mtime().await? != mtime {
            tracing::info!(path = %self.path, "config file changed during evaluation, waiting for the next event");
            return Ok(());
        }

        if !scope.contains(&self.ctx.nodename) {
            return Err(CheckError::NotInScope(self.ctx.nodename.clone()));
        }

        self.last_mtime = Some(mtime);
        let cfg = InstanceConfig {
            checksum,
            updated: DateTime::<Utc>::from(mtime),
            scope,
            nodename: self.ctx.nodename.clone(),
        };
        if self.published && self.cfg.same_content(&cfg) {
            return Ok(());
        }

        let mutation = Mutation::SetInstanceConfig {
            path: self.path.clone(),
            value: cfg.clone(),
        };
        match self.ctx.store.apply_local(mutation).await {
            Ok(generation) => {
                tracing::info!(path = %self.path, generation, checksum = %cfg.checksum, scope = ?cfg.scope, "config published");
                self.cfg = cfg;
                self.published = true;
            }
            Err(e) => tracing::error!(path = %self.path, error = %e, "failed to publish config"),
        }
        Ok(())
    }

    async fn mtime(&self) -> Result<SystemTime, CheckError> {
        let meta = tokio::fs::metadata(&self.filename)
            .await
            .map_err(|_| CheckError::NoFile(self.filename.clone()))?;
        Ok(meta.modified()?)
    }

    async fn delete(&mut self) {
        if self.published {
            let mutation = Mutation::DelInstanceConfig { path: self.path.clone() };
            if let Err(e) = self.ctx.store.apply_local(mutation).await {
                tracing::warn!(path = %self.path, error = %e, "failed to delete config");
            }
            self.published = false;
        }
        let mutation = Mutation::DelInstanceStatus { path: self.path.clone() };
        if let Err(e) = self.ctx.store.apply_local(mutation).await {
            tracing::debug!(path = %self.path, error = %e, "failed to delete status");
        }
    }

    async fn finish(&mut self, subs: &mut Subs, discover: &mpsc::Sender<DiscoverCmd>) {
        subs.stop();
        let dropped = bus::drop_pending(&mut self.cmd_rx, self.ctx.config.worker.drop_pending_timeout()).await;
        if dropped > 0 {
            tracing::debug!(path = %self.path, dropped, "dropped pending commands");
        }
        let done = DiscoverCmd::CfgDone {
            path: self.path.clone(),
            filename: self.filename.clone(),
            worker: self.id,
        };
        if discover.send(done).await.is_err() {
            tracing::debug!(path = %self.path, "discovery already gone");
        }
        tracing::info!(path = %self.path, "config watcher stopped");
    }
}
