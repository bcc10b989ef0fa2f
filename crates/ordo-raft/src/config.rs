//! Raft configuration (timeouts, limits, tuning parameters).
//!
//! Durations are written in YAML as integer milliseconds:
//!
//! ```yaml
//! heartbeat_interval: 100
//! election_timeout_min: 300
//! election_timeout_max: 600
//! snapshot_auto_trigger_threshold: 10000
//! ```
//!
//! Every field is optional and falls back to its default.

use crate::error::{RaftError, Result};
use crate::id::GroupId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Raft configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Raft group this server belongs to.
    pub group_id: GroupId,

    /// Heartbeat interval (leader → followers).
    ///
    /// Must be < election_timeout_min to prevent spurious elections.
    ///
    /// Default: 150ms
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// Randomized between [min, max] to prevent split votes.
    ///
    /// Default: 300ms
    #[serde(with = "duration_ms")]
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 600ms
    #[serde(with = "duration_ms")]
    pub election_timeout_max: Duration,

    /// Deadline for a single outbound RPC.
    ///
    /// Default: 200ms
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 1000 entries
    pub max_entries_per_append: usize,

    /// Soft cap on payload bytes per AppendEntries RPC.
    ///
    /// A batch always carries at least one entry.
    ///
    /// Default: 4 MiB
    pub max_append_bytes: usize,

    /// Maximum number of writes waiting for commit.
    ///
    /// Further writes fail with `ResourceUnavailable`.
    ///
    /// Default: 4096
    pub max_pending_requests: usize,

    /// Snapshot trigger: entries applied since the last snapshot.
    ///
    /// 0 disables automatic snapshots.
    ///
    /// Default: 10,000 entries
    pub snapshot_auto_trigger_threshold: u64,

    /// InstallSnapshot chunk size (bytes).
    ///
    /// Default: 1 MiB
    pub snapshot_chunk_size: usize,

    /// Apply batch size (entries fetched from the log per apply round).
    ///
    /// Default: 256
    pub apply_batch_size: usize,

    /// How long a write waits for commit and apply.
    ///
    /// Default: 5000ms
    #[serde(with = "duration_ms")]
    pub propose_timeout: Duration,

    /// How long a linearizable read waits for leadership confirmation and apply.
    ///
    /// Default: 2000ms
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            group_id: GroupId::NIL,

            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            rpc_timeout: Duration::from_millis(200),

            // Replication tuning
            max_entries_per_append: 1000,
            max_append_bytes: 4 * 1024 * 1024,
            max_pending_requests: 4096,

            // Snapshots
            snapshot_auto_trigger_threshold: 10_000,
            snapshot_chunk_size: 1024 * 1024,

            apply_batch_size: 256,
            propose_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(2000),
        }
    }
}

impl RaftConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(config_err("heartbeat_interval must be > 0"));
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(config_err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(config_err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }

        if self.rpc_timeout.is_zero() {
            return Err(config_err("rpc_timeout must be > 0"));
        }

        if self.max_entries_per_append == 0 {
            return Err(config_err("max_entries_per_append must be > 0"));
        }

        if self.max_pending_requests == 0 {
            return Err(config_err("max_pending_requests must be > 0"));
        }

        if self.snapshot_chunk_size == 0 {
            return Err(config_err("snapshot_chunk_size must be > 0"));
        }

        if self.apply_batch_size == 0 {
            return Err(config_err("apply_batch_size must be > 0"));
        }

        Ok(())
    }

    /// Generate a random election timeout in [min, max].
    pub fn random_election_timeout(&self) -> Duration {
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RaftConfig = serde_yaml::from_str(yaml).map_err(|e| config_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| config_err(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&contents)
    }
}

fn config_err(reason: impl Into<String>) -> RaftError {
    RaftError::Config {
        reason: reason.into(),
    }
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = RaftConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_heartbeat() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_min: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RaftError::Config { .. })));
    }

    #[test]
    fn test_invalid_election_timeout() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(600),
            election_timeout_max: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout() {
        let config = RaftConfig::default();

        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = "heartbeat_interval: 50\nelection_timeout_min: 200\nelection_timeout_max: 400\nmax_pending_requests: 8\n";
        let config = RaftConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(50));
        assert_eq!(config.election_timeout_max, Duration::from_millis(400));
        assert_eq!(config.max_pending_requests, 8);
        // Untouched fields keep defaults
        assert_eq!(config.propose_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_yaml_group_id() {
        let group = GroupId::random();
        let yaml = format!("group_id: {}\n", group);
        let config = RaftConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.group_id, group);
    }

    #[test]
    fn test_yaml_rejects_invalid() {
        let yaml = "heartbeat_interval: 900\n";
        assert!(RaftConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("raft.yaml");
        std::fs::write(&path, "rpc_timeout: 75\n").unwrap();
        let config = RaftConfig::load_from_file(&path).unwrap();
        assert_eq!(config.rpc_timeout, Duration::from_millis(75));

        assert!(RaftConfig::load_from_file(dir.path().join("missing.yaml")).is_err());
    }
}
