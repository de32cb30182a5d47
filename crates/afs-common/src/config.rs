//! Configuration types for AFS
//!
//! This module defines the configuration structures threaded from the
//! server entry point down to the storage layout, the write-ahead log and
//! each session worker. Every section falls back to its defaults so that a
//! partial TOML file is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Root configuration for AFS
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AfsConfig {
    /// Storage layout configuration
    pub storage: StorageConfig,
    /// Write-ahead log configuration
    pub wal: WalConfig,
    /// Session worker and API server configuration
    pub server: ServerConfig,
    /// Authorization gate configuration
    pub auth: AuthConfig,
    /// Metadata service (post-commit registration) configuration
    pub metadata: MetadataConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AfsConfig {
    /// Check option values that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.storage.incoming_share.is_empty()
            || self.storage.incoming_share.starts_with('.')
            || self.storage.incoming_share.contains('/')
        {
            return Err(Error::Configuration(format!(
                "invalid incoming share: {:?}",
                self.storage.incoming_share
            )));
        }
        if self.storage.shard_depth == 0 || self.storage.shard_depth > 8 {
            return Err(Error::Configuration(
                "storage.shard_depth must be between 1 and 8".into(),
            ));
        }
        if self.server.pool_size == 0 {
            return Err(Error::Configuration("server.pool_size must be > 0".into()));
        }
        if self.server.max_read_size == 0 {
            return Err(Error::Configuration(
                "server.max_read_size must be > 0".into(),
            ));
        }
        for (name, value) in [
            ("server.worker_timeout_ms", self.server.worker_timeout_ms),
            ("server.idle_timeout_ms", self.server.idle_timeout_ms),
            ("server.operation_timeout_ms", self.server.operation_timeout_ms),
            ("server.coordinator_timeout_ms", self.server.coordinator_timeout_ms),
            ("server.maintenance_interval_ms", self.server.maintenance_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::Configuration(format!("{name} must be > 0")));
            }
        }
        if self.auth.interactive_session_key == self.auth.transaction_manager_session_key {
            return Err(Error::Configuration(
                "interactive and transaction manager session keys must differ".into(),
            ));
        }
        Ok(())
    }
}

/// Storage layout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding all shares
    pub root: PathBuf,
    /// Globally unique identifier of this storage instance
    pub instance_uuid: Uuid,
    /// Share that receives newly created owners
    pub incoming_share: String,
    /// Number of two-hex-digit shard directories between share and owner
    pub shard_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/afs/store"),
            instance_uuid: Uuid::nil(),
            incoming_share: "1".to_string(),
            shard_depth: 3,
        }
    }
}

/// Write-ahead log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding the log file
    pub root: PathBuf,
    /// Sync mode for log writes
    pub sync_mode: WalSyncMode,
    /// Log size above which the maintenance loop checkpoints
    pub checkpoint_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/afs/wal"),
            sync_mode: WalSyncMode::Always,
            checkpoint_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// WAL synchronization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// Sync after every record (safest, slowest)
    #[default]
    Always,
    /// Sync at prepare, commit and abort only
    OnPrepare,
}

/// Session worker and API server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of concurrent session workers
    pub pool_size: usize,
    /// Maximum bytes returned by a single read
    pub max_read_size: u64,
    /// Time a worker may stay bound to a transaction without a request
    pub worker_timeout_ms: u64,
    /// Time an idle worker survives without a request
    pub idle_timeout_ms: u64,
    /// Upper bound for a single API call
    pub operation_timeout_ms: u64,
    /// Time a coordinated transaction may stay prepared before rollback
    pub coordinator_timeout_ms: u64,
    /// Interval of the in-doubt expiry / checkpoint loop
    pub maintenance_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            max_read_size: 16 * 1024 * 1024, // 16 MB
            worker_timeout_ms: 10 * 60 * 1000,
            idle_timeout_ms: 30 * 60 * 1000,
            operation_timeout_ms: 60 * 1000,
            coordinator_timeout_ms: 10 * 60 * 1000,
            maintenance_interval_ms: 30 * 1000,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub const fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    #[must_use]
    pub const fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_timeout_ms)
    }

    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// Authorization gate configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Idle expiry of cached authentication results
    pub authentication_cache_idle_ms: u64,
    /// Idle expiry of cached authorization decisions
    pub authorization_cache_idle_ms: u64,
    /// Session key marking interactive callers
    pub interactive_session_key: String,
    /// Session key marking calls driven by the external transaction manager
    pub transaction_manager_session_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authentication_cache_idle_ms: 60 * 60 * 1000,
            authorization_cache_idle_ms: 60 * 60 * 1000,
            interactive_session_key: "interactive".to_string(),
            transaction_manager_session_key: "transaction-manager".to_string(),
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub const fn authentication_cache_idle(&self) -> Duration {
        Duration::from_millis(self.authentication_cache_idle_ms)
    }

    #[must_use]
    pub const fn authorization_cache_idle(&self) -> Duration {
        Duration::from_millis(self.authorization_cache_idle_ms)
    }
}

/// Metadata service configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Registration endpoint; registration is disabled when unset
    pub endpoint: Option<String>,
    /// Timeout of a registration request
    pub timeout_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5 * 1000,
        }
    }
}

impl MetadataConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AfsConfig::default();
        assert_eq!(config.storage.incoming_share, "1");
        assert_eq!(config.wal.sync_mode, WalSyncMode::Always);
        assert_eq!(config.server.pool_size, 64);
        assert!(config.metadata.endpoint.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            [storage]
            root = "/data/store"
            incoming_share = "7"

            [wal]
            sync_mode = "on_prepare"

            [server]
            pool_size = 4
            idle_timeout_ms = 1500
        "#;
        let config: AfsConfig = toml::from_str(text).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/data/store"));
        assert_eq!(config.storage.incoming_share, "7");
        assert_eq!(config.storage.shard_depth, 3);
        assert_eq!(config.wal.sync_mode, WalSyncMode::OnPrepare);
        assert_eq!(config.server.pool_size, 4);
        assert_eq!(config.server.idle_timeout(), Duration::from_millis(1500));
        assert_eq!(config.server.max_read_size, 16 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AfsConfig::default();
        config.server.pool_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = AfsConfig::default();
        config.storage.incoming_share = "../escape".into();
        assert!(config.validate().is_err());

        let mut config = AfsConfig::default();
        config.auth.transaction_manager_session_key = config.auth.interactive_session_key.clone();
        assert!(config.validate().is_err());

        let mut config = AfsConfig::default();
        config.server.operation_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
