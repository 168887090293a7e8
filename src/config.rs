//! Configuration loading and management.
//!
//! Two layers of configuration exist:
//!
//! - [`Config`]: node-local settings read once at startup from a TOML file
//!   (listen address, data directory, bootstrap behavior).
//! - [`NetworkConfig`]: network-wide settings replicated through the log as
//!   Config records, so that every node agrees on limits and expiration at
//!   every apply point. It is part of the IRC state and of snapshots.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("network.password not set and ROBUSTIRC_NETWORK_PASSWORD empty")]
    MissingPassword,
}

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: NetworkSection,
    pub listen: ListenSection,
    pub raft: RaftSection,
    #[serde(default)]
    pub compaction: CompactionSection,
}

/// Identity of the network this node serves.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    /// Name of the network (e.g. "robustirc.net"), used as the server prefix
    /// in every IRC message.
    pub name: String,
    /// Shared cluster password. Falls back to the ROBUSTIRC_NETWORK_PASSWORD
    /// environment variable when absent.
    #[serde(default)]
    pub password: Option<String>,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    /// host:port the HTTP API binds to.
    pub address: SocketAddr,
}

/// Raft bootstrap and storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftSection {
    /// Directory holding raftlog/, irclog/, snapshots/ and peers.json.
    pub dir: PathBuf,
    /// Become a leader without any followers. Set if and only if starting
    /// the first node of a network for the first time.
    #[serde(default)]
    pub single_node: bool,
    /// host:port of an existing node to join.
    #[serde(default)]
    pub join: Option<String>,
    /// Publicly reachable host:port of this node. Defaults to the listen
    /// address.
    #[serde(default)]
    pub peer_addr: Option<String>,
}

/// Compaction settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompactionSection {
    /// Nanosecond UNIX timestamp to use as "now" during compaction, so that
    /// canary replays produce byte-identical compacted logs across runs.
    #[serde(default)]
    pub canary_start: Option<i64>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The effective network password, with environment fallback.
    pub fn network_password(&self) -> Result<String, ConfigError> {
        if let Some(password) = &self.network.password {
            if !password.is_empty() {
                return Ok(password.clone());
            }
        }
        match std::env::var("ROBUSTIRC_NETWORK_PASSWORD") {
            Ok(password) if !password.is_empty() => Ok(password),
            _ => Err(ConfigError::MissingPassword),
        }
    }

    /// The effective peer address other nodes should dial.
    pub fn peer_addr(&self) -> String {
        self.raft
            .peer_addr
            .clone()
            .unwrap_or_else(|| self.listen.address.to_string())
    }
}

/// Network-wide configuration, replicated through Config records.
///
/// Carried as TOML in the record payload and applied atomically at its commit
/// point; every field has a default so a partial document is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Seconds of inactivity after which the leader deletes a session.
    pub session_expiration_secs: u64,
    /// Maximum number of live sessions.
    pub session_limit: u64,
    /// Maximum number of channels.
    pub channel_limit: u64,
    /// Seconds of output-stream retention. Output records older than this
    /// are garbage-collected and their input records become compactable.
    pub output_retention_secs: u64,
    /// Operator credentials: name to password.
    pub operators: BTreeMap<String, String>,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig {
            session_expiration_secs: 600,
            session_limit: 5000,
            channel_limit: 5000,
            // Chosen to comfortably cover bridge outages; see DESIGN.md.
            output_retention_secs: 7 * 24 * 3600,
            operators: BTreeMap::new(),
        }
    }
}

impl NetworkConfig {
    /// Parse from the TOML payload of a Config record.
    pub fn from_toml(data: &str) -> Result<NetworkConfig, toml::de::Error> {
        toml::from_str(data)
    }

    /// Session expiration in nanoseconds.
    pub fn session_expiration_nanos(&self) -> i64 {
        self.session_expiration_secs as i64 * 1_000_000_000
    }

    /// Output retention in nanoseconds.
    pub fn output_retention_nanos(&self) -> i64 {
        self.output_retention_secs as i64 * 1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_minimal() {
        let parsed: Config = toml::from_str(
            r#"
            [network]
            name = "robustirc.net"
            password = "hunter2"

            [listen]
            address = "127.0.0.1:60667"

            [raft]
            dir = "/tmp/robustirc"
            single_node = true
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network.name, "robustirc.net");
        assert!(parsed.raft.single_node);
        assert_eq!(parsed.peer_addr(), "127.0.0.1:60667");
        assert!(parsed.compaction.canary_start.is_none());
    }

    #[test]
    fn test_network_config_defaults() {
        let config = NetworkConfig::from_toml("").unwrap();
        assert_eq!(config, NetworkConfig::default());
        assert_eq!(config.session_expiration_nanos(), 600_000_000_000);
    }

    #[test]
    fn test_network_config_partial() {
        let config = NetworkConfig::from_toml("session_limit = 10").unwrap();
        assert_eq!(config.session_limit, 10);
        assert_eq!(config.channel_limit, NetworkConfig::default().channel_limit);
    }

    #[test]
    fn test_network_config_operators() {
        let config = NetworkConfig::from_toml(
            r#"
            [operators]
            mero = "s3cure"
            "#,
        )
        .unwrap();
        assert_eq!(config.operators.get("mero").map(String::as_str), Some("s3cure"));
    }
}
