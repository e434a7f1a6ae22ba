//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BACKUP_ENGINE__<SECTION>__<KEY>`, e.g. `BACKUP_ENGINE__STORE__BUCKET`).

use crate::storage::RetryConfig;
use crate::utils::errors::{EngineError, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service role, used as the generation name prefix (`<role>-backup_`)
    #[serde(default = "default_role")]
    pub role: String,

    /// Storage volume to back up
    pub storage_root: PathBuf,

    /// Scratch and lock files; wiped per run
    pub work_dir: PathBuf,

    /// Durable local copy of consolidated archives
    pub archive_root: PathBuf,

    pub store: StoreConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub archiver: ArchiverConfig,

    #[serde(default)]
    pub packaging: PackagingConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub log: LogConfig,
}

/// Destination bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// A directory standing in for the bucket (NAS mounts, tests)
    Local { path: PathBuf },

    S3 {
        bucket: String,
        endpoint: String,
        #[serde(default = "default_region")]
        region: String,
        access_key: String,
        secret_key: String,
        /// Per-request timeout; large uploads need generous values
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
        #[serde(default)]
        retry: RetryConfig,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EncryptionConfig {
    Gpg {
        recipient: String,
        #[serde(default = "default_gpg_binary")]
        binary: PathBuf,
        /// Secret key passphrase, only needed for restores
        #[serde(default)]
        passphrase_file: Option<PathBuf>,
    },
    None,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArchiverConfig {
    /// Built-in tar implementation
    Native,
    /// The system `tar` binary
    Command {
        #[serde(default = "default_tar_binary")]
        binary: PathBuf,
    },
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        ArchiverConfig::Native
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagingConfig {
    /// Files below this size are "small" (default: 1 MiB)
    #[serde(default = "default_small_max_bytes")]
    pub small_max_bytes: u64,

    /// Files below this size are "medium"; the rest are packaged one by one (default: 1 GiB)
    #[serde(default = "default_medium_max_bytes")]
    pub medium_max_bytes: u64,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            small_max_bytes: default_small_max_bytes(),
            medium_max_bytes: default_medium_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Daily archive generations to keep (at least 3 are always kept)
    #[serde(default = "default_daily_count")]
    pub daily_count: usize,

    /// Monthly archive generations to keep
    #[serde(default = "default_monthly_count")]
    pub monthly_count: usize,

    /// Raw generations kept in the bucket, by count and by age in days
    #[serde(default = "default_incremental_days")]
    pub incremental_days: u32,

    /// Sweeps abort when the newest generation is older than this
    #[serde(default = "default_staleness_days")]
    pub staleness_days: u32,

    /// Offset used for day/month buckets, e.g. "+02:00"
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl RetentionConfig {
    pub fn offset(&self) -> Result<FixedOffset> {
        self.utc_offset
            .parse::<FixedOffset>()
            .map_err(|e| EngineError::Config(format!("invalid utc_offset '{}': {e}", self.utc_offset)))
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily_count: default_daily_count(),
            monthly_count: default_monthly_count(),
            incremental_days: default_incremental_days(),
            staleness_days: default_staleness_days(),
            utc_offset: default_utc_offset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub enabled: bool,

    /// libpq connection string passed to `pg_dump --dbname`
    #[serde(default)]
    pub url: String,

    /// Name used in dump object keys (`<role>-<name>-db-backup_<instant>.sql.zst`)
    #[serde(default = "default_db_name")]
    pub name: String,

    #[serde(default = "default_pg_dump")]
    pub pg_dump: PathBuf,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            name: default_db_name(),
            pg_dump: default_pg_dump(),
            compression_level: default_compression_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_role() -> String {
    "file-broker".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_gpg_binary() -> PathBuf {
    PathBuf::from("gpg")
}

fn default_tar_binary() -> PathBuf {
    PathBuf::from("tar")
}

fn default_small_max_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_medium_max_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_daily_count() -> usize {
    7
}

fn default_monthly_count() -> usize {
    12
}

fn default_incremental_days() -> u32 {
    7
}

fn default_staleness_days() -> u32 {
    7
}

fn default_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_db_name() -> String {
    "session-db".to_string()
}

fn default_pg_dump() -> PathBuf {
    PathBuf::from("pg_dump")
}

fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("BACKUP_ENGINE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.role.is_empty() || self.role.contains('/') {
            return Err(EngineError::Config(format!("invalid role '{}'", self.role)));
        }
        if self.packaging.small_max_bytes > self.packaging.medium_max_bytes {
            return Err(EngineError::Config(
                "packaging.small_max_bytes must not exceed medium_max_bytes".into(),
            ));
        }
        if let EncryptionConfig::Gpg { recipient, .. } = &self.encryption {
            if recipient.is_empty() {
                return Err(EngineError::Config("encryption.recipient is required".into()));
            }
        }
        if self.db.enabled && self.db.url.is_empty() {
            return Err(EngineError::Config("db.url is required when db.enabled".into()));
        }
        self.retention.offset()?;
        Ok(())
    }
}
