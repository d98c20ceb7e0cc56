//! # Warden Common
//!
//! Shared types used across Warden components.
//!
//! ## Modules
//! - `path` - Object identity (`namespace/kind/name`)
//! - `status` - Status enums and their order-independent combinators
//! - `instance` - Per-node instance config, status and monitor records
//! - `cluster` - The cluster snapshot tree and its filters
//! - `error` - Common error types
//! - `constants` - Shared configuration constants

pub mod cluster;
pub mod constants;
pub mod error;
pub mod instance;
pub mod path;
pub mod status;

pub use cluster::*;
pub use error::WardenError;
pub use instance::*;
pub use path::{Kind, ObjectPath};
pub use status::*;
