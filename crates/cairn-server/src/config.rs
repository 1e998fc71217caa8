//! Node configuration file.
//!
//! A node file holds the UDP bind address plus a `[cluster]` table that maps
//! straight onto [`ClusterConfig`]. Every field is optional; missing values
//! take their defaults.

use std::net::SocketAddr;
use std::path::Path;

use cairn_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UDP address the node listens on.
    pub bind: String,
    pub cluster: ClusterConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4000".into(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads and parses a TOML node file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("failed to parse config file '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        self.bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {e}", self.bind))
    }
}
