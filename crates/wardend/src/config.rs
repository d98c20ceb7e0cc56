//! Daemon configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_common::constants::{
    BUS_QUEUE_SIZE, DEFAULT_CONFIG_DIR, DEFAULT_LISTEN_ADDR, DEFAULT_VAR_DIR, DROP_PENDING_TIMEOUT_MS,
    HB_FRAGMENT_IDLE_SECS, HB_INTERVAL_MS, HB_MAX_DATAGRAM_SIZE, HB_MAX_FRAGMENTS, HB_TIMEOUT_SECS,
    MAX_PATCH_QUEUE,
};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// This node's name (system hostname if not set)
    #[serde(default = "default_nodename")]
    pub nodename: String,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Object configuration files (`*.conf`)
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Per-object runtime files (`<path>/status.json`)
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub hb: HbConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub discover: DiscoverConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Cluster identity
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Shared secret the heartbeat key is derived from
    #[serde(default)]
    pub secret: String,

    /// Initial member list; the cluster object's scope takes over once known
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            secret: String::new(),
            nodes: Vec::new(),
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HbConfig {
    /// Interval between two outgoing messages
    #[serde(default = "default_hb_interval")]
    pub interval_ms: u64,

    /// A stream with no success for this long is stale
    #[serde(default = "default_hb_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Incomplete messages are dropped after this idle period
    #[serde(default = "default_fragment_idle")]
    pub fragment_idle_secs: u64,

    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,

    /// Peer liveness check period
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    #[serde(default = "default_max_patch_queue")]
    pub max_patch_queue: usize,

    #[serde(default)]
    pub drivers: Vec<HbDriverConfig>,
}

impl HbConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fragment_idle(&self) -> Duration {
        Duration::from_secs(self.fragment_idle_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for HbConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_hb_interval(),
            timeout_secs: default_hb_timeout(),
            max_datagram_size: default_max_datagram_size(),
            fragment_idle_secs: default_fragment_idle(),
            max_fragments: default_max_fragments(),
            check_interval_ms: default_check_interval(),
            max_patch_queue: default_max_patch_queue(),
            drivers: Vec::new(),
        }
    }
}

/// One UDP heartbeat driver
#[derive(Debug, Clone, Deserialize)]
pub struct HbDriverConfig {
    /// Stream ids are `<name>.tx` and `<name>.rx`
    pub name: String,

    /// Receiver bind address, e.g. `0.0.0.0:10000`
    pub bind: String,

    /// Destinations: unicast peers or one multicast group
    #[serde(default)]
    pub peers: Vec<String>,

    /// Interface address used to join a multicast group
    #[serde(default)]
    pub multicast_interface: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber queue length
    #[serde(default = "default_bus_queue")]
    pub queue_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_size: default_bus_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// Configuration directory scan period
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
}

impl DiscoverConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// How long an exiting worker keeps draining its command queue
    #[serde(default = "default_drop_pending")]
    pub drop_pending_timeout_ms: u64,
}

impl WorkerConfig {
    pub fn drop_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.drop_pending_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            drop_pending_timeout_ms: default_drop_pending(),
        }
    }
}

fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_config_dir() -> PathBuf { PathBuf::from(DEFAULT_CONFIG_DIR) }
fn default_var_dir() -> PathBuf { PathBuf::from(DEFAULT_VAR_DIR) }
fn default_cluster_name() -> String { "default".to_string() }
fn default_hb_interval() -> u64 { HB_INTERVAL_MS }
fn default_hb_timeout() -> u64 { HB_TIMEOUT_SECS }
fn default_max_datagram_size() -> usize { HB_MAX_DATAGRAM_SIZE }
fn default_fragment_idle() -> u64 { HB_FRAGMENT_IDLE_SECS }
fn default_max_fragments() -> usize { HB_MAX_FRAGMENTS }
fn default_check_interval() -> u64 { 1000 }
fn default_max_patch_queue() -> usize { MAX_PATCH_QUEUE }
fn default_bus_queue() -> usize { BUS_QUEUE_SIZE }
fn default_scan_interval() -> u64 { 1000 }
fn default_drop_pending() -> u64 { DROP_PENDING_TIMEOUT_MS }

fn default_nodename() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut config = if Path::new(config_path).exists() {
            let settings = config::Config::builder()
                .add_source(config::File::with_name(config_path))
                .build()
                .context("Failed to load config file")?;

            settings
                .try_deserialize()
                .context("Failed to parse config")?
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
            Self::default()
        };

        if let Some(ref nodename) = args.nodename {
            config.nodename = nodename.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(ref dir) = args.config_dir {
            config.config_dir = dir.clone();
        }
        if let Some(ref dir) = args.var_dir {
            config.var_dir = dir.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.nodename.is_empty(), "nodename must not be empty");
        anyhow::ensure!(
            self.hb.drivers.is_empty() || !self.cluster.secret.is_empty(),
            "cluster.secret is required when heartbeat drivers are configured"
        );
        anyhow::ensure!(self.hb.interval_ms > 0, "hb.interval_ms must be positive");
        Ok(())
    }

    /// Cluster members known at startup (at least this node)
    pub fn initial_nodes(&self) -> Vec<String> {
        if self.cluster.nodes.is_empty() {
            vec![self.nodename.clone()]
        } else {
            self.cluster.nodes.clone()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nodename: default_nodename(),
            listen_addr: default_listen_addr(),
            config_dir: default_config_dir(),
            var_dir: default_var_dir(),
            cluster: ClusterSettings::default(),
            hb: HbConfig::default(),
            bus: BusConfig::default(),
            discover: DiscoverConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.hb.max_datagram_size, HB_MAX_DATAGRAM_SIZE);
        assert_eq!(config.hb.timeout(), Duration::from_secs(HB_TIMEOUT_SECS));
        assert!(config.validate().is_ok());
        assert_eq!(config.initial_nodes(), vec![config.nodename.clone()]);
    }

    #[test]
    fn test_parse_toml() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                nodename = "n1"

                [cluster]
                name = "c1"
                secret = "s"
                nodes = ["n1", "n2"]

                [hb]
                interval_ms = 500

                [[hb.drivers]]
                name = "hb#1"
                bind = "0.0.0.0:10000"
                peers = ["224.3.29.71:10000"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.nodename, "n1");
        assert_eq!(config.cluster.nodes, vec!["n1", "n2"]);
        assert_eq!(config.hb.interval(), Duration::from_millis(500));
        assert_eq!(config.hb.timeout_secs, HB_TIMEOUT_SECS);
        assert_eq!(config.hb.drivers[0].name, "hb#1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_drivers_require_secret() {
        let mut config = AppConfig::default();
        config.hb.drivers.push(HbDriverConfig {
            name: "hb#1".into(),
            bind: "0.0.0.0:10000".into(),
            peers: vec![],
            multicast_interface: None,
        });
        assert!(config.validate().is_err());
    }
}
