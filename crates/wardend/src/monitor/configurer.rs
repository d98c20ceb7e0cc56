//! Object configuration file reading.
//!
//! Object files are INI:
//!
//! ```ini
//! [DEFAULT]
//! nodes = n1 n2
//! ```
//!
//! `*` in an object node list stands for every cluster member, and an
//! object without `nodes` is scoped to the whole cluster. The cluster object
//! (`cluster.conf`) lists the members in `[cluster] nodes`, defaulting to the
//! local node alone. An unknown membership also falls back to the local node.

use std::path::Path;

use warden_common::ObjectPath;

use super::CheckError;

/// Computes the scope of an object from its configuration file
pub trait Configurer: Send + Sync {
    /// `cluster_nodes` is the current membership of the local node's cluster
    fn scope(
        &self,
        path: &ObjectPath,
        filename: &Path,
        localhost: &str,
        cluster_nodes: &[String],
    ) -> Result<Vec<String>, CheckError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IniConfigurer;

impl IniConfigurer {
    fn load(filename: &Path) -> Result<config::Config, CheckError> {
        let name = filename.to_string_lossy();
        Ok(config::Config::builder()
            .add_source(config::File::new(&name, config::FileFormat::Ini))
            .build()?)
    }

    /// First of `keys` present in the file
    fn lookup(cfg: &config::Config, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| cfg.get_string(k).ok())
    }
}

impl Configurer for IniConfigurer {
    fn scope(
        &self,
        path: &ObjectPath,
        filename: &Path,
        localhost: &str,
        cluster_nodes: &[String],
    ) -> Result<Vec<String>, CheckError> {
        let cfg = Self::load(filename)?;
        if path.is_cluster() {
            return Ok(match Self::lookup(&cfg, &["cluster.nodes", "CLUSTER.nodes"]) {
                Some(nodes) => split_nodes(&nodes),
                None => vec![localhost.to_string()],
            });
        }

        let members: Vec<String> = if cluster_nodes.is_empty() {
            vec![localhost.to_string()]
        } else {
            cluster_nodes.to_vec()
        };
        Ok(match Self::lookup(&cfg, &["DEFAULT.nodes", "default.nodes"]) {
            Some(nodes) => expand_nodes(split_nodes(&nodes), &members),
            None => members,
        })
    }
}

/// Replace `*` with `members`, keeping the first occurrence of each node
fn expand_nodes(nodes: Vec<String>, members: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for node in nodes {
        let names = if node == "*" { members.to_vec() } else { vec![node] };
        for name in names {
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

/// Split a node list on whitespace and commas, dropping duplicates
pub fn split_nodes(value: &str) -> Vec<String> {
    let mut nodes: Vec<String> = Vec::new();
    for node in value.split(|c: char| c.is_whitespace() || c == ',') {
        if !node.is_empty() && !nodes.iter().any(|n| n == node) {
            nodes.push(node.to_string());
        }
    }
    nodes
}
