//! Configuration management for LumaTM

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::MAX_SERVER_ID_SIZE;

/// Default server id when none is configured
pub const DEFAULT_SERVER_ID: &str = "lumatm";

/// Journal implementation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    /// Dual-file disk journal
    Disk,
    /// No journal at all, in-doubt transactions cannot be resolved after a crash
    Null,
}

/// Main configuration structure for the transaction manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unique id of this transaction manager, embedded in every gtrid
    pub server_id: Option<String>,
    /// First journal file
    pub log_part1_filename: PathBuf,
    /// Second journal file
    pub log_part2_filename: PathBuf,
    /// fsync the journal when forced
    pub forced_write_enabled: bool,
    /// Let one fsync cover the writes of several concurrent transactions
    pub force_batching_enabled: bool,
    /// Size of each journal file in megabytes
    pub max_log_size_mb: u64,
    /// Only journal the statuses recovery needs
    pub filter_log_status: bool,
    /// Skip records failing their checksum instead of refusing to open
    pub skip_corrupted_logs: bool,
    /// Run the 2PC phases concurrently on a worker pool
    pub asynchronous_2pc: bool,
    /// Worker pool size for asynchronous 2PC (0 = number of CPUs)
    pub async_pool_size: usize,
    /// Warn when a transaction completes without any enlisted resource
    pub warn_about_zero_resource_transaction: bool,
    /// Default transaction timeout in seconds
    pub default_transaction_timeout_secs: u64,
    /// How long shutdown waits for in-flight transactions, in seconds
    pub graceful_shutdown_interval_secs: u64,
    /// Interval between background recovery runs in seconds (0 disables)
    pub background_recovery_interval_secs: u64,
    /// Only recover branches created by this server id
    pub current_node_only_recovery: bool,
    /// Allow more than one last-resource-commit resource per transaction
    pub allow_multiple_lrc: bool,
    /// Journal implementation
    pub journal: JournalKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: None,
            log_part1_filename: PathBuf::from("lumatm1.tlog"),
            log_part2_filename: PathBuf::from("lumatm2.tlog"),
            forced_write_enabled: true,
            force_batching_enabled: true,
            max_log_size_mb: 2,
            filter_log_status: true,
            skip_corrupted_logs: false,
            asynchronous_2pc: false,
            async_pool_size: 0,
            warn_about_zero_resource_transaction: true,
            default_transaction_timeout_secs: 60,
            graceful_shutdown_interval_secs: 60,
            background_recovery_interval_secs: 60,
            current_node_only_recovery: true,
            allow_multiple_lrc: false,
            journal: JournalKind::Disk,
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Journal files placed in a directory, keeping the default file names
    pub fn with_journal_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_part1_filename = dir.as_ref().join("lumatm1.tlog");
        self.log_part2_filename = dir.as_ref().join("lumatm2.tlog");
        self
    }

    /// Check values the transaction manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.server_id {
            if id.is_empty() {
                return Err(Error::Config("server_id must not be empty".to_string()));
            }
            if !id.is_ascii() {
                return Err(Error::Config(format!(
                    "server_id '{}' must be US-ASCII",
                    id
                )));
            }
        }
        if self.max_log_size_mb == 0 {
            return Err(Error::Config("max_log_size_mb must be at least 1".to_string()));
        }
        if self.log_part1_filename == self.log_part2_filename {
            return Err(Error::Config(
                "log_part1_filename and log_part2_filename must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Server id bytes used as Uid prefix, truncated to what fits an XA gtrid
    pub fn server_id_bytes(&self) -> Vec<u8> {
        let id = match &self.server_id {
            Some(id) => id.as_str(),
            None => {
                warn!(
                    "no server_id configured, using '{}'; make sure every transaction manager sharing resources has its own id",
                    DEFAULT_SERVER_ID
                );
                DEFAULT_SERVER_ID
            }
        };

        let mut bytes = id.as_bytes().to_vec();
        if bytes.len() > MAX_SERVER_ID_SIZE {
            warn!(
                "server_id '{}' is longer than {} bytes, truncating it; make sure the truncated id is still unique",
                id, MAX_SERVER_ID_SIZE
            );
            bytes.truncate(MAX_SERVER_ID_SIZE);
        }
        bytes
    }

    /// Size of one journal file in bytes
    pub fn max_log_size_bytes(&self) -> u64 {
        self.max_log_size_mb * 1024 * 1024
    }

    pub fn default_transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.default_transaction_timeout_secs)
    }

    pub fn graceful_shutdown_interval(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_interval_secs)
    }

    /// Background recovery interval, `None` when disabled
    pub fn background_recovery_interval(&self) -> Option<Duration> {
        match self.background_recovery_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.forced_write_enabled);
        assert!(!config.asynchronous_2pc);
        assert_eq!(config.max_log_size_bytes(), 2 * 1024 * 1024);
        assert_eq!(config.default_transaction_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumatm.toml");
        std::fs::write(
            &path,
            "server_id = \"node-1\"\nasynchronous_2pc = true\nbackground_recovery_interval_secs = 0\njournal = \"null\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server_id.as_deref(), Some("node-1"));
        assert!(config.asynchronous_2pc);
        assert_eq!(config.background_recovery_interval(), None);
        assert_eq!(config.journal, JournalKind::Null);
        // unspecified fields keep their defaults
        assert_eq!(config.max_log_size_mb, 2);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumatm.json");
        std::fs::write(&path, r#"{"server_id": "json-node", "max_log_size_mb": 8}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server_id.as_deref(), Some("json-node"));
        assert_eq!(config.max_log_size_mb, 8);
    }

    #[test]
    fn test_rejects_non_ascii_server_id() {
        let config = Config {
            server_id: Some("nœud".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_long_server_id_is_truncated() {
        let config = Config {
            server_id: Some("x".repeat(80)),
            ..Default::default()
        };
        assert_eq!(config.server_id_bytes().len(), MAX_SERVER_ID_SIZE);
    }
}
