//! Shared constants for Warden components.

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1215";

/// Default object configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/warden";

/// Default variable data directory (instance status files)
pub const DEFAULT_VAR_DIR: &str = "/var/lib/warden";

/// Object configuration file extension
pub const CONFIG_FILE_EXT: &str = "conf";

/// Instance status file name, under `<var_dir>/<path>/`
pub const STATUS_FILE_NAME: &str = "status.json";

/// Heartbeat message interval (milliseconds)
pub const HB_INTERVAL_MS: u64 = 1000;

/// Peer considered stale after this long without a successful exchange (seconds)
pub const HB_TIMEOUT_SECS: u64 = 15;

/// Maximum heartbeat datagram size (bytes)
pub const HB_MAX_DATAGRAM_SIZE: usize = 1400;

/// Incomplete fragment sets are dropped after this idle period (seconds)
pub const HB_FRAGMENT_IDLE_SECS: u64 = 10;

/// Upper bound on fragments per heartbeat message
pub const HB_MAX_FRAGMENTS: usize = 4096;

/// Retained local patches before laggards are forced to a full resync
pub const MAX_PATCH_QUEUE: usize = 1000;

/// Default per-subscriber event queue length
pub const BUS_QUEUE_SIZE: usize = 1024;

/// Grace period when draining a stopping worker's command channel (milliseconds)
pub const DROP_PENDING_TIMEOUT_MS: u64 = 100;

/// Bus label keys
pub mod labels {
    /// Object path label
    pub const PATH: &str = "path";

    /// Node name label
    pub const NODE: &str = "node";

    /// Origin label, e.g. `api`
    pub const FROM: &str = "from";
}
