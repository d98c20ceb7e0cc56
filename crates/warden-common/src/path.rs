//! Object path: `namespace/kind/name`.
//!
//! The short forms are accepted and produced where unambiguous:
//! - `name` → root namespace, `svc` kind (`cluster` → `ccfg` kind)
//! - `kind/name` → root namespace

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::WardenError;

/// Namespace of objects declared without one
pub const ROOT_NAMESPACE: &str = "root";

/// Object kinds known to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Svc,
    Vol,
    Cfg,
    Sec,
    Usr,
    /// The cluster configuration object
    Ccfg,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Svc => "svc",
            Self::Vol => "vol",
            Self::Cfg => "cfg",
            Self::Sec => "sec",
            Self::Usr => "usr",
            Self::Ccfg => "ccfg",
        }
    }
}

impl FromStr for Kind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "svc" => Ok(Self::Svc),
            "vol" => Ok(Self::Vol),
            "cfg" => Ok(Self::Cfg),
            "sec" => Ok(Self::Sec),
            "usr" => Ok(Self::Usr),
            "ccfg" => Ok(Self::Ccfg),
            other => Err(WardenError::InvalidInput(format!("unknown kind: {other}"))),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a cluster object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath {
    pub namespace: String,
    pub kind: Kind,
    pub name: String,
}

impl ObjectPath {
    pub fn new(namespace: impl Into<String>, kind: Kind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    /// The cluster configuration object (`cluster`)
    pub fn cluster() -> Self {
        Self::new(ROOT_NAMESPACE, Kind::Ccfg, "cluster")
    }

    pub fn is_cluster(&self) -> bool {
        self.kind == Kind::Ccfg
    }

    /// Parse a path string, see module docs for the accepted forms
    pub fn parse(s: &str) -> Result<Self, WardenError> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(WardenError::InvalidInput(format!("invalid path: {s:?}")));
        }
        match parts.as_slice() {
            ["cluster"] => Ok(Self::cluster()),
            [name] => Ok(Self::new(ROOT_NAMESPACE, Kind::Svc, *name)),
            [kind, name] => Ok(Self::new(ROOT_NAMESPACE, kind.parse()?, *name)),
            [namespace, kind, name] => Ok(Self::new(*namespace, kind.parse()?, *name)),
            _ => Err(WardenError::InvalidInput(format!("invalid path: {s:?}"))),
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == ROOT_NAMESPACE {
            match self.kind {
                Kind::Svc => return f.write_str(&self.name),
                Kind::Ccfg if self.name == "cluster" => return f.write_str("cluster"),
                _ => return write!(f, "{}/{}", self.kind, self.name),
            }
        }
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl FromStr for ObjectPath {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ObjectPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
