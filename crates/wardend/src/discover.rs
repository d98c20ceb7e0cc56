//! Discovery coordinator.
//!
//! Polls the configuration directory and keeps one config watcher running
//! per local object file and one aggregator per object known anywhere in
//! the cluster. Also feeds the local instance status files into the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use warden_common::constants::{CONFIG_FILE_EXT, STATUS_FILE_NAME};
use warden_common::{InstanceStatus, ObjectPath};

use crate::bus::{Event, EventKind, Label};
use crate::monitor::configurer::Configurer;
use crate::monitor::smon::MonitorStarter;
use crate::monitor::{instcfg, svcagg, WorkerCmd, WorkerHandle};
use crate::state::AppState;
use crate::store::Mutation;

/// Upper bound on the wait for workers at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Completion notices sent by the workers. `worker` is the id of the
/// handle the worker was started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverCmd {
    CfgDone {
        path: ObjectPath,
        filename: PathBuf,
        worker: u64,
    },
    AggDone {
        path: ObjectPath,
        worker: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigFile {
    filename: PathBuf,
    mtime: SystemTime,
}

pub struct Discover {
    ctx: AppState,
    configurer: Arc<dyn Configurer>,
    monitor: Arc<dyn MonitorStarter>,

    cmd_tx: mpsc::Sender<DiscoverCmd>,
    cmd_rx: mpsc::Receiver<DiscoverCmd>,

    /// Config files seen by the last scan
    files: HashMap<ObjectPath, ConfigFile>,
    cfg_workers: HashMap<ObjectPath, WorkerHandle>,
    agg_workers: HashMap<ObjectPath, WorkerHandle>,
    status_mtimes: HashMap<ObjectPath, SystemTime>,
}

impl Discover {
    pub fn new(ctx: &AppState, configurer: Arc<dyn Configurer>, monitor: Arc<dyn MonitorStarter>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        Self {
            ctx: ctx.clone(),
            configurer,
            monitor,
            cmd_tx,
            cmd_rx,
            files: HashMap::new(),
            cfg_workers: HashMap::new(),
            agg_workers: HashMap::new(),
            status_mtimes: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let cancel = self.ctx.cancel.child_token();
        let bus = self.ctx.bus.clone();
        let mut sub_cfg = bus.subscribe("discover", EventKind::ConfigUpdated, vec![]);
        let mut sub_cluster =
            bus.subscribe("discover", EventKind::ClusterConfigUpdated, vec![Label::node(&self.ctx.nodename)]);

        let mut ticker = tokio::time::interval(self.ctx.config.discover.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(config_dir = %self.ctx.config.config_dir.display(), "discovery started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => self.on_done(cmd, true).await,
                Some(event) = sub_cfg.recv() => self.on_config(event),
                Some(_) = sub_cluster.recv() => {
                    // watchers that gave up may be in scope now
                    let running = &self.cfg_workers;
                    self.files.retain(|path, _| running.contains_key(path));
                }
                _ = ticker.tick() => self.scan().await,
            }
        }

        sub_cfg.stop();
        sub_cluster.stop();
        self.wait_workers().await;
        tracing::info!("discovery stopped");
    }

    /// Forget a finished worker. A notice from a worker that was already
    /// replaced is ignored. With `restart`, an aggregator ending while its
    /// object is still configured somewhere is started again.
    async fn on_done(&mut self, cmd: DiscoverCmd, restart: bool) {
        match cmd {
            DiscoverCmd::CfgDone { path, filename, worker } => {
                if !remove_worker(&mut self.cfg_workers, &path, worker) {
                    tracing::debug!(path = %path, worker, "stale config watcher notice");
                    return;
                }
                tracing::debug!(path = %path, filename = %filename.display(), "config watcher done");
                self.status_mtimes.remove(&path);
            }
            DiscoverCmd::AggDone { path, worker } => {
                if !remove_worker(&mut self.agg_workers, &path, worker) {
                    tracing::debug!(path = %path, worker, "stale aggregator notice");
                    return;
                }
                tracing::debug!(path = %path, "aggregator done");
                if !restart {
                    return;
                }
                match self.ctx.store.config_nodes(&path).await {
                    Ok(nodes) if !nodes.is_empty() => {
                        tracing::info!(path = %path, nodes = ?nodes, "object still configured, restarting aggregator");
                        self.start_aggregator(path, nodes);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(path = %path, error = %e, "failed to read object config nodes"),
                }
            }
        }
    }

    /// Start an aggregator for objects configured on any node
    fn on_config(&mut self, event: Event) {
        let Event::ConfigUpdated { path, node, value } = event else {
            return;
        };
        // a running aggregator follows the update itself, an exiting one
        // is restarted on its completion notice
        if self.agg_workers.get(&path).is_some_and(|h| !h.is_closed()) {
            return;
        }
        let mut scope = value.scope;
        if !scope.contains(&node) {
            scope.push(node);
        }
        self.start_aggregator(path, scope);
    }

    fn start_aggregator(&mut self, path: ObjectPath, scope: Vec<String>) {
        tracing::info!(path = %path, "starting aggregator");
        let handle = svcagg::start(&self.ctx, path.clone(), scope, self.cmd_tx.clone());
        self.agg_workers.insert(path, handle);
    }

    async fn scan(&mut self) {
        let found = match scan_dir(&self.ctx.config.config_dir).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(error = %e, "config dir scan failed");
                return;
            }
        };

        let gone: Vec<ObjectPath> = self.files.keys().filter(|p| !found.contains_key(*p)).cloned().collect();
        for path in gone {
            if let Some(file) = self.files.remove(&path) {
                tracing::info!(path = %path, "config file removed");
                self.ctx.bus.publish(
                    Event::CfgFileRemoved {
                        path: path.clone(),
                        filename: file.filename,
                    },
                    &[Label::path(&path)],
                );
            }
        }

        for (path, file) in found {
            if self.files.get(&path).is_some_and(|known| known.mtime == file.mtime) {
                continue;
            }
            let running = self.cfg_workers.get(&path).is_some_and(|h| !h.is_closed());
            if running {
                self.ctx.bus.publish(
                    Event::CfgFileUpdated {
                        path: path.clone(),
                        filename: file.filename.clone(),
                    },
                    &[Label::path(&path)],
                );
            } else {
                tracing::info!(path = %path, filename = %file.filename.display(), "starting config watcher");
                let handle = instcfg::start(
                    &self.ctx,
                    path.clone(),
                    file.filename.clone(),
                    self.configurer.clone(),
                    self.monitor.clone(),
                    self.cmd_tx.clone(),
                );
                self.cfg_workers.insert(path.clone(), handle);
            }
            self.files.insert(path, file);
        }

        self.scan_status().await;
    }

    /// Apply the status files of locally configured objects
    async fn scan_status(&mut self) {
        let paths: Vec<ObjectPath> = self.cfg_workers.keys().filter(|p| !p.is_cluster()).cloned().collect();
        for path in paths {
            let filename = self.ctx.config.var_dir.join(path.to_string()).join(STATUS_FILE_NAME);
            let Ok(mtime) = tokio::fs::metadata(&filename).await.and_then(|m| m.modified()) else {
                continue;
            };
            if self.status_mtimes.get(&path) == Some(&mtime) {
                continue;
            }
            self.status_mtimes.insert(path.clone(), mtime);

            let value: InstanceStatus = match tokio::fs::read(&filename).await {
                Ok(data) => match serde_json::from_slice(&data) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "invalid status file");
                        continue;
                    }
                },
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "status file read failed");
                    continue;
                }
            };
            if let Err(e) = self.ctx.store.apply_local(Mutation::SetInstanceStatus { path: path.clone(), value }).await {
                tracing::warn!(path = %path, error = %e, "failed to apply status");
            }
        }
    }

    async fn wait_workers(&mut self) {
        for handle in self.cfg_workers.values().chain(self.agg_workers.values()) {
            handle.send(WorkerCmd::Exit);
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.cfg_workers.is_empty() || !self.agg_workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.cmd_rx.recv()).await {
                Ok(Some(cmd)) => self.on_done(cmd, false).await,
                _ => {
                    tracing::warn!(
                        cfg = self.cfg_workers.len(),
                        agg = self.agg_workers.len(),
                        "workers still running at shutdown"
                    );
                    break;
                }
            }
        }
    }
}

/// Remove the handle of `path` if it belongs to `worker`
fn remove_worker(workers: &mut HashMap<ObjectPath, WorkerHandle>, path: &ObjectPath, worker: u64) -> bool {
    if workers.get(path).is_some_and(|h| h.id() == worker) {
        workers.remove(path);
        return true;
    }
    false
}

/// Object path of a config file, from its location under `root`
fn object_path(root: &Path, filename: &Path) -> Option<ObjectPath> {
    let rel = filename.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<&str> = rel.components().filter_map(|c| c.as_os_str().to_str()).collect();
    ObjectPath::parse(&parts.join("/")).ok()
}

async fn scan_dir(root: &Path) -> std::io::Result<HashMap<ObjectPath, ConfigFile>> {
    let mut found = HashMap::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.path();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_dir() {
                dirs.push(filename);
                continue;
            }
            if filename.extension().and_then(|e| e.to_str()) != Some(CONFIG_FILE_EXT) {
                continue;
            }
            let Some(path) = object_path(root, &filename) else {
                tracing::debug!(filename = %filename.display(), "not an object config file");
                continue;
            };
            found.insert(
                path,
                ConfigFile {
                    filename,
                    mtime: meta.modified()?,
                },
            );
        }
    }
    Ok(found)
}
