//! Configuration for the credit engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Hash-chained audit log file (None disables file auditing)
    pub audit_log_path: Option<PathBuf>,

    /// Emit JSON logs from the sweeper binary
    pub log_json: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Credit issuance configuration
    pub credit: CreditConfig,

    /// Expiration sweep schedule
    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/credit-engine"),
            service_name: "credit-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            audit_log_path: None,
            log_json: false,
            rocksdb: RocksDBConfig::default(),
            credit: CreditConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL on every commit
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            sync_writes: true,
        }
    }
}

/// Credit issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfig {
    /// Days a freshly issued credit stays spendable
    pub grace_period_days: i64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            grace_period_days: 30,
        }
    }
}

/// Longest grace period accepted (100 years)
pub const MAX_GRACE_PERIOD_DAYS: i64 = 36_500;

impl CreditConfig {
    /// Grace period as a duration
    pub fn grace_period(&self) -> crate::Result<chrono::Duration> {
        if !(1..=MAX_GRACE_PERIOD_DAYS).contains(&self.grace_period_days) {
            return Err(crate::Error::Config(format!(
                "credit.grace_period_days must be between 1 and {}, got {}",
                MAX_GRACE_PERIOD_DAYS, self.grace_period_days
            )));
        }
        chrono::Duration::try_days(self.grace_period_days).ok_or_else(|| {
            crate::Error::Config(format!(
                "credit.grace_period_days out of range: {}",
                self.grace_period_days
            ))
        })
    }
}

/// Expiration sweep schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Times of day (UTC, "HH:MM") at which the sweep runs
    pub run_times: Vec<String>,

    /// Run the sweep scheduler at all
    pub enabled: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            run_times: vec!["02:00".to_string()], // daily, off-peak
            enabled: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("CREDIT_ENGINE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(path) = std::env::var("CREDIT_ENGINE_AUDIT_LOG") {
            config.audit_log_path = Some(PathBuf::from(path));
        }

        if let Ok(days) = std::env::var("CREDIT_ENGINE_GRACE_DAYS") {
            config.credit.grace_period_days = days.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid grace days '{}': {}", days, e))
            })?;
        }

        if let Ok(times) = std::env::var("CREDIT_ENGINE_SWEEP_TIMES") {
            config.sweep.run_times = times.split(',').map(|t| t.trim().to_string()).collect();
        }

        if let Ok(json) = std::env::var("CREDIT_ENGINE_LOG_JSON") {
            config.log_json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        self.credit.grace_period()?;
        if self.sweep.enabled && self.sweep.run_times.is_empty() {
            return Err(crate::Error::Config(
                "sweep.run_times must not be empty when the sweep is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
