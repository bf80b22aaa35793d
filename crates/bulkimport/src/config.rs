//! Engine configuration and per-job parameters

use crate::backoff::RetryBackoff;
use crate::error::{ImportError, Result};
use crate::importer::ImportOptions;
use crate::pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Engine-wide tuning, shared by every job a controller runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Weight at which the scanner cuts a batch
    #[serde(default = "default_batch_weight")]
    pub batch_weight: u64,

    /// Worker threads once the import goes multi-threaded
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Batches that may wait for a worker before the scanner blocks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Batches imported on the scanning thread before switching to the pool
    #[serde(default = "default_multithreading_threshold")]
    pub multithreading_threshold: u64,

    /// Keep the folder phase single-threaded regardless of the threshold
    #[serde(default = "default_single_threaded_folder_phase")]
    pub single_threaded_folder_phase: bool,

    /// Interval between progress reports while waiting for the pool to drain
    #[serde(default = "default_status_log_interval")]
    pub status_log_interval_secs: u64,

    /// How often the scanner checks whether the pool has drained
    #[serde(default = "default_drain_poll_interval")]
    pub drain_poll_interval_ms: u64,

    /// Consecutive out-of-order attempts, with no other batch committing in
    /// between, before the job fails
    #[serde(default = "default_max_out_of_order_retries")]
    pub max_out_of_order_retries: u32,

    /// Step of the Fibonacci backoff before an out-of-order batch is retried (0 disables)
    #[serde(default = "default_out_of_order_backoff")]
    pub out_of_order_backoff_ms: u64,

    /// Longest single out-of-order backoff
    #[serde(default = "default_max_out_of_order_backoff")]
    pub max_out_of_order_backoff_ms: u64,
}

fn default_batch_weight() -> u64 {
    100
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get() * 4)
        .unwrap_or(16)
}

fn default_queue_capacity() -> usize {
    100
}

fn default_multithreading_threshold() -> u64 {
    3
}

fn default_single_threaded_folder_phase() -> bool {
    true
}

fn default_status_log_interval() -> u64 {
    600
}

fn default_drain_poll_interval() -> u64 {
    100
}

fn default_max_out_of_order_retries() -> u32 {
    100
}

fn default_out_of_order_backoff() -> u64 {
    10
}

fn default_max_out_of_order_backoff() -> u64 {
    1_000
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_weight: default_batch_weight(),
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
            multithreading_threshold: default_multithreading_threshold(),
            single_threaded_folder_phase: default_single_threaded_folder_phase(),
            status_log_interval_secs: default_status_log_interval(),
            drain_poll_interval_ms: default_drain_poll_interval(),
            max_out_of_order_retries: default_max_out_of_order_retries(),
            out_of_order_backoff_ms: default_out_of_order_backoff(),
            max_out_of_order_backoff_ms: default_max_out_of_order_backoff(),
        }
    }
}

impl ImportConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ImportConfig =
            toml::from_str(&content).map_err(|e| ImportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ImportError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_weight == 0 {
            return Err(ImportError::Config("batch_weight must be at least 1".to_string()));
        }
        if self.pool_size == 0 {
            return Err(ImportError::Config("pool_size must be at least 1".to_string()));
        }
        if self.max_out_of_order_retries == 0 {
            return Err(ImportError::Config(
                "max_out_of_order_retries must be at least 1".to_string(),
            ));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err(ImportError::Config(
                "drain_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    pub fn out_of_order_backoff(&self) -> RetryBackoff {
        RetryBackoff::new(
            Duration::from_millis(self.out_of_order_backoff_ms),
            Duration::from_millis(self.max_out_of_order_backoff_ms),
        )
    }
}

pub const PARAM_REPLACE_EXISTING: &str = "replaceExisting";
pub const PARAM_DRY_RUN: &str = "dryRun";

/// Free-form per-job parameters, shared by the engine and the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportParameters {
    values: BTreeMap<String, String>,
}

impl ImportParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Lenient boolean: true/false, yes/no, on/off, 1/0. Absent is `default`.
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        let Some(raw) = self.get(name) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            other => Err(ImportError::InvalidParameter {
                name: name.to_string(),
                message: format!("expected a boolean, got '{}'", other),
            }),
        }
    }

    pub fn u64_or(&self, name: &str, default: u64) -> Result<u64> {
        match self.get(name).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ImportError::InvalidParameter {
                name: name.to_string(),
                message: format!("expected a non-negative integer, got '{}'", raw),
            }),
        }
    }

    /// Engine options carried in the parameters.
    pub fn import_options(&self) -> Result<ImportOptions> {
        Ok(ImportOptions {
            replace_existing: self.bool_or(PARAM_REPLACE_EXISTING, false)?,
            dry_run: self.bool_or(PARAM_DRY_RUN, false)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ImportConfig::default();
        assert_eq!(config.batch_weight, 100);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.multithreading_threshold, 3);
        assert!(config.pool_size >= 4);
        assert_eq!(config.status_log_interval(), Duration::from_secs(600));
        assert!(config.out_of_order_backoff().delay(40) <= Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ImportConfig = toml::from_str("batch_weight = 5\npool_size = 2\n").unwrap();
        assert_eq!(config.batch_weight, 5);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.pool_config().total_permits(), 102);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bulkimport.toml");
        let config = ImportConfig {
            batch_weight: 42,
            pool_size: 3,
            ..ImportConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ImportConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "batch_weight = 0\n").unwrap();
        assert!(matches!(ImportConfig::load(&path), Err(ImportError::Config(_))));

        std::fs::write(&path, "batch_weight = \"lots\"\n").unwrap();
        assert!(matches!(ImportConfig::load(&path), Err(ImportError::Config(_))));
    }

    #[test]
    fn test_parameter_parsing() {
        let params = ImportParameters::new()
            .with(PARAM_REPLACE_EXISTING, "Yes")
            .with("folderCount", "7");
        let options = params.import_options().unwrap();
        assert!(options.replace_existing);
        assert!(!options.dry_run);
        assert_eq!(params.u64_or("folderCount", 1).unwrap(), 7);
        assert_eq!(params.u64_or("missing", 9).unwrap(), 9);

        let bad = ImportParameters::new().with(PARAM_DRY_RUN, "maybe");
        match bad.import_options() {
            Err(ImportError::InvalidParameter { name, .. }) => assert_eq!(name, PARAM_DRY_RUN),
            other => panic!("expected InvalidParameter, got {:?}", other),
        }
        assert!(ImportParameters::new().with("n", "-1").u64_or("n", 0).is_err());
    }
}
