//! # wardend - Warden cluster node daemon
//!
//! Keeps an eventually consistent view of the cluster across peers and
//! derives per-object aggregated status from it.
//!
//! ## Architecture
//! ```text
//! config dir ─▶ discover ─▶ instcfg / svcagg ─┐
//!                                             ▼
//!   peers ◀─ hb tx ◀─ store (single writer) ◀─ bus ─▶ HTTP
//!   peers ─▶ hb rx ─▶ hb manager ─▶ store
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod bus;
mod config;
mod discover;
mod hb;
mod monitor;
mod routes;
mod state;
mod store;

use bus::Bus;
use config::AppConfig;
use discover::Discover;
use hb::HbManager;
use hb::ctrl::PeerCtrl;
use monitor::configurer::IniConfigurer;
use monitor::smon::PassiveMonitor;
use state::AppState;
use store::{Store, StoreConfig};
use warden_common::ClusterConfig;

/// Warden cluster node daemon
#[derive(Parser, Debug)]
#[command(name = "wardend")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/warden/wardend.toml", env = "WARDEN_CONFIG")]
    config: String,

    /// Node name (overrides config, defaults to the hostname)
    #[arg(long, env = "WARDEN_NODENAME")]
    nodename: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Object configuration directory (overrides config)
    #[arg(long, env = "WARDEN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Instance status directory (overrides config)
    #[arg(long, env = "WARDEN_VAR_DIR")]
    var_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting wardend");

    let config = AppConfig::load(&args.config, &args)?;
    info!(path = %args.config, nodename = %config.nodename, "configuration loaded");

    let cancel = CancellationToken::new();
    let bus = Bus::new(config.bus.queue_size);

    // Replicated store
    let (store, store_handle) = Store::new(
        StoreConfig {
            nodename: config.nodename.clone(),
            cluster: ClusterConfig {
                name: config.cluster.name.clone(),
                nodes: config.initial_nodes(),
            },
            interval: config.hb.interval(),
            peer_timeout: config.hb.timeout(),
            max_patch_queue: config.hb.max_patch_queue,
            queue_size: config.bus.queue_size,
        },
        bus.clone(),
    );
    let outbound = store.outbound();
    // outlives the workers, which still write to it on their way out
    let store_cancel = CancellationToken::new();
    let store_task = tokio::spawn(store.run(store_cancel.clone()));

    // Peer liveness
    let (peer_ctrl, ctrl_handle) =
        PeerCtrl::new(&config.nodename, config.hb.timeout(), config.hb.check_interval(), bus.clone());
    let ctrl_task = tokio::spawn(peer_ctrl.run(cancel.child_token()));

    // Heartbeat drivers
    let hb_task = if config.hb.drivers.is_empty() {
        info!("no heartbeat driver configured, running standalone");
        None
    } else {
        let manager = HbManager::new(
            &config.hb,
            &config.cluster.name,
            &config.cluster.secret,
            &config.nodename,
            config.initial_nodes(),
            ctrl_handle,
            store_handle.clone(),
            outbound,
        );
        Some(tokio::spawn(manager.run(cancel.child_token())))
    };

    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(config, bus, store_handle, cancel.clone());

    // Object discovery and per-object workers
    let discover = Discover::new(&state, Arc::new(IniConfigurer), Arc::new(PassiveMonitor));
    let discover_task = tokio::spawn(discover.run());

    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "listening");

    let shutdown = cancel.clone();
    let shutdown_signal = async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
                info!("shutdown signal received");
            }
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    cancel.cancel();
    let _ = discover_task.await;
    if let Some(task) = hb_task {
        let _ = task.await;
    }
    let _ = ctrl_task.await;
    store_cancel.cancel();
    let _ = store_task.await;

    info!("wardend shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .context("Failed to initialize logging")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
            .context("Failed to initialize logging")?;
    }

    Ok(())
}
