//! TOML configuration for the stashd daemon.
//!
//! Layered like the rest of the tooling: an explicit path (flag or
//! `STASHD_CONFIG`), then `/etc/stashd/stashd.toml`, then compiled-in
//! defaults. Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "STASHD_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/stashd/stashd.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the daemon and CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StashConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StashConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. `explicit` (the `--config` flag, which clap also fills from `STASHD_CONFIG`).
    /// 2. `/etc/stashd/stashd.toml`.
    /// 3. Compiled-in defaults.
    ///
    /// An explicit path that cannot be loaded is an error; the system path is
    /// only a best effort.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding the catalog and the backup history.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/stashd/stashd.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Base directory for `local` destinations configured with a relative path.
    pub backup_dir: PathBuf,
    /// Parent of the per-run working directories.
    pub temp_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/backups/stashd"),
            temp_dir: std::env::temp_dir().join("stashd"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// How often a running backup refreshes `heartbeat_at`.
    pub heartbeat_interval_secs: u64,
    /// Running entries whose heartbeat is older than this are reclaimed on startup.
    pub stale_threshold_secs: u64,
    /// Upper bound for a single dump tool invocation.
    pub command_timeout_secs: u64,
    /// Upper bound for a key-value snapshot, which can hang on unresponsive servers.
    pub snapshot_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when a tool overruns its timeout.
    pub kill_grace_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            stale_threshold_secs: 300,
            command_timeout_secs: 6 * 60 * 60,
            snapshot_timeout_secs: 600,
            kill_grace_secs: 10,
        }
    }
}

impl ExecutionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of runs executing at the same time.
    pub workers: usize,
    /// Backoff before the first retry; doubles with every further attempt.
    pub retry_backoff_ms: u64,
    /// Cap for the exponential backoff.
    pub max_backoff_ms: u64,
    /// Scheduler evaluation period.
    pub scheduler_tick_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry_backoff_ms: 5_000,
            max_backoff_ms: 5 * 60 * 1_000,
            scheduler_tick_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Environment variable holding the 64-hex-char AES-256 key.
    pub key_env: String,
    /// Key file used (and generated) when the variable is not set.
    pub key_file: PathBuf,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            key_env: "STASHD_ENCRYPTION_KEY".to_string(),
            key_file: PathBuf::from("/var/lib/stashd/secret.key"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Locations of the native dump tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Fallback `pg_dump` when no version-specific binary matches.
    pub pg_dump: String,
    /// Client used to query the server version.
    pub psql: String,
    /// Directories containing `<major>/bin/pg_dump` installations.
    pub pg_install_roots: Vec<PathBuf>,
    pub mysqldump: String,
    pub mongodump: String,
    pub redis_cli: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".to_string(),
            psql: "psql".to_string(),
            pg_install_roots: vec![PathBuf::from("/usr/lib/postgresql")],
            mysqldump: "mysqldump".to_string(),
            mongodump: "mongodump".to_string(),
            redis_cli: "redis-cli".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// `"text"` or `"json"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = StashConfig::default();

        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/stashd/stashd.db"));
        assert_eq!(cfg.execution.heartbeat_interval_secs, 30);
        assert!(
            cfg.execution.heartbeat_interval() < cfg.execution.stale_threshold(),
            "heartbeat must be shorter than the staleness window"
        );
        assert_eq!(cfg.execution.kill_grace_secs, 10);
        assert_eq!(cfg.queue.workers, 2);
        assert_eq!(cfg.security.key_env, "STASHD_ENCRYPTION_KEY");
        assert_eq!(cfg.tools.pg_dump, "pg_dump");
        assert_eq!(cfg.tools.redis_cli, "redis-cli");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[storage]
db_path = "/opt/stashd/state.db"

[paths]
backup_dir = "/srv/backups"
temp_dir = "/srv/tmp"

[execution]
heartbeat_interval_secs = 10
stale_threshold_secs = 120
snapshot_timeout_secs = 60

[queue]
workers = 4
retry_backoff_ms = 250

[tools]
pg_dump = "/usr/local/bin/pg_dump"
pg_install_roots = ["/usr/lib/postgresql", "/opt/pg"]

[logging]
level = "debug"
format = "json"
"#;

        let cfg: StashConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.storage.db_path, PathBuf::from("/opt/stashd/state.db"));
        assert_eq!(cfg.paths.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(cfg.execution.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(cfg.execution.stale_threshold(), Duration::from_secs(120));
        assert_eq!(cfg.execution.snapshot_timeout(), Duration::from_secs(60));
        // Unset keys in a present section fall back to defaults.
        assert_eq!(cfg.execution.kill_grace_secs, 10);
        assert_eq!(cfg.queue.workers, 4);
        assert_eq!(cfg.queue.retry_backoff_ms, 250);
        assert_eq!(cfg.tools.pg_install_roots.len(), 2);
        assert_eq!(cfg.tools.psql, "psql");
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: StashConfig = toml::from_str("").unwrap();
        let defaults = StashConfig::default();
        assert_eq!(cfg.storage.db_path, defaults.storage.db_path);
        assert_eq!(cfg.queue.workers, defaults.queue.workers);
        assert_eq!(cfg.tools.mongodump, defaults.tools.mongodump);
    }

    #[test]
    fn test_load_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(StashConfig::resolve(Some(&missing)).is_err());
    }
}
