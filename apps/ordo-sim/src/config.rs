//! Simulator configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use ordo_raft::RaftConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Simulator configuration.
///
/// Example YAML:
/// ```yaml
/// servers: 3
/// data_dir: "/tmp/ordo-sim"
/// workload:
///   clients: 4
///   requests: 200
///   partition_leader_every: 50
/// raft:
///   heartbeat_interval: 50
///   election_timeout_min: 150
///   election_timeout_max: 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Number of voters in the group
    #[serde(default = "default_servers")]
    pub servers: usize,

    /// Root for per-server storage; in-memory when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Engine tuning shared by every server
    #[serde(default)]
    pub raft: RaftConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Concurrent clients
    #[serde(default = "default_clients")]
    pub clients: usize,

    /// Total INCREMENT requests across all clients
    #[serde(default = "default_requests")]
    pub requests: u64,

    /// Isolate the current leader after this many acknowledged writes (0 = never)
    #[serde(default)]
    pub partition_leader_every: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            clients: default_clients(),
            requests: default_requests(),
            partition_leader_every: 0,
        }
    }
}

fn default_servers() -> usize {
    3
}

fn default_clients() -> usize {
    4
}

fn default_requests() -> u64 {
    100
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            data_dir: None,
            workload: WorkloadConfig::default(),
            raft: RaftConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: SimConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - ORDO_SERVERS
    /// - ORDO_DATA_DIR
    /// - ORDO_CLIENTS
    /// - ORDO_REQUESTS
    /// - ORDO_PARTITION_LEADER_EVERY
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = SimConfig::default();

        if let Some(servers) = env_parse("ORDO_SERVERS")? {
            config.servers = servers;
        }
        config.data_dir = std::env::var("ORDO_DATA_DIR").ok().map(PathBuf::from);
        if let Some(clients) = env_parse("ORDO_CLIENTS")? {
            config.workload.clients = clients;
        }
        if let Some(requests) = env_parse("ORDO_REQUESTS")? {
            config.workload.requests = requests;
        }
        if let Some(every) = env_parse("ORDO_PARTITION_LEADER_EVERY")? {
            config.workload.partition_leader_every = every;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers == 0 {
            return Err(ConfigError::InvalidField("servers must be > 0".to_string()));
        }

        if self.workload.clients == 0 {
            return Err(ConfigError::InvalidField("clients must be > 0".to_string()));
        }

        // Isolating a leader needs a majority left to elect a new one
        if self.workload.partition_leader_every > 0 && self.servers < 3 {
            return Err(ConfigError::InvalidField(
                "partition_leader_every needs at least 3 servers".to_string(),
            ));
        }

        if let Some(dir) = &self.data_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(ConfigError::InvalidField(
                    "data_dir exists but is not a directory".to_string(),
                ));
            }
        }

        self.raft
            .validate()
            .map_err(|e| ConfigError::InvalidField(e.to_string()))
    }

    /// Storage directory of server `n`.
    pub fn server_dir(&self, n: usize) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(format!("server-{}", n)))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidField(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.servers, 3);
        assert_eq!(config.workload.clients, 4);
        assert!(config.server_dir(0).is_none());
    }

    #[test]
    fn test_yaml_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "servers: 5\nworkload:\n  requests: 10\nraft:\n  heartbeat_interval: 20\n  election_timeout_min: 100\n  election_timeout_max: 200"
        )
        .unwrap();

        let config = SimConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.servers, 5);
        assert_eq!(config.workload.requests, 10);
        assert_eq!(config.workload.clients, 4);
        assert_eq!(config.raft.heartbeat_interval.as_millis(), 20);
    }

    #[test]
    fn test_rejects_partitions_on_small_groups() {
        let mut config = SimConfig::default();
        config.servers = 1;
        config.workload.partition_leader_every = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField(_))
        ));
    }

    #[test]
    fn test_server_dirs() {
        let config = SimConfig {
            data_dir: Some(PathBuf::from("/tmp/ordo")),
            ..SimConfig::default()
        };
        assert_eq!(
            config.server_dir(2),
            Some(PathBuf::from("/tmp/ordo/server-2"))
        );
    }
}
