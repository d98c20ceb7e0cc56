//! Daemon context shared by the workers and the HTTP handlers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::AppConfig;
use crate::store::StoreHandle;

/// Created once at startup and passed down explicitly
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// This node's name
    pub nodename: String,

    /// In-process event bus
    pub bus: Bus,

    /// Replicated cluster store client
    pub store: StoreHandle,

    /// Daemon lifetime; every worker token is a child of it
    pub cancel: CancellationToken,

    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, bus: Bus, store: StoreHandle, cancel: CancellationToken) -> Self {
        let nodename = config.nodename.clone();
        Self {
            config: Arc::new(config),
            nodename,
            bus,
            store,
            cancel,
            started_at: Utc::now(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
