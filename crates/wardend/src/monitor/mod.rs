//! Per-object workers.
//!
//! - `instcfg` - watches a local configuration file and publishes the
//!   instance config
//! - `svcagg` - folds every node's instance data into the object aggregate
//! - `smon` - the instance monitor collaborator
//! - `configurer` - scope evaluation from configuration files

pub mod configurer;
pub mod instcfg;
pub mod smon;
pub mod svcagg;

#[cfg(test)]
pub(crate) mod testutil;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::StoreError;

/// Commands accepted by every worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCmd {
    /// Poison pill
    Exit,
    /// Re-evaluate from scratch
    Refresh,
}

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Command side of a running worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: u64,
    tx: mpsc::Sender<WorkerCmd>,
}

impl WorkerHandle {
    pub fn new(tx: mpsc::Sender<WorkerCmd>) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Process-unique id, echoed back in the worker's completion notice
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a command; false if the worker is gone
    pub fn send(&self, cmd: WorkerCmd) -> bool {
        self.tx.try_send(cmd).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Why a configuration file check ended the watcher
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("config file {0} is gone")]
    NoFile(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("empty scope")]
    EmptyScope,

    #[error("{0} is not in scope anymore")]
    NotInScope(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
