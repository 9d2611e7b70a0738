//! Service configuration.
//!
//! Loaded from a TOML file or built directly. Sizing, worker, and logging
//! knobs all have defaults suitable for a single-node deployment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Cache service configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Sizing and identity of the cache service
    #[serde(default)]
    pub service: ServiceConfig,

    /// Worker queue configuration
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sizing and identity of the cache service.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Cache memory size in MB. 0 means "use system memory capped by
    /// memory_cap_ratio".
    #[serde(default)]
    pub memory_size_mb: u64,

    /// Directory for spilled rows. Spill is disabled when unset; an
    /// exhausted memory pool then fails inserts instead.
    #[serde(default)]
    pub spill_root: Option<PathBuf>,

    /// Whether the service generates row ids itself. Self-generating
    /// services start in the build phase; otherwise clients supply ids and
    /// reads and writes interleave freely.
    #[serde(default = "default_generate_id")]
    pub generate_id: bool,

    /// Fraction of system memory the pool may claim when memory_size_mb
    /// is 0.
    #[serde(default = "default_memory_cap_ratio")]
    pub memory_cap_ratio: f32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            memory_size_mb: 0,
            spill_root: None,
            generate_id: default_generate_id(),
            memory_cap_ratio: default_memory_cap_ratio(),
        }
    }
}

/// Worker queue configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker queues (default: number of CPUs)
    pub queues: Option<usize>,

    /// Request slots per queue. Bounds the number of in-flight sub-requests
    /// a single batch may dispatch.
    #[serde(default = "default_slots_per_queue")]
    pub slots_per_queue: usize,

    /// Route fetch work to a worker pinned to the row's NUMA node instead
    /// of picking a worker at random.
    #[serde(default = "default_numa_affinity")]
    pub numa_affinity: bool,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            queues: None,
            slots_per_queue: default_slots_per_queue(),
            numa_affinity: default_numa_affinity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG when set)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Include timestamps in log output
    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: default_timestamps(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output with ANSI colors
    #[default]
    Pretty,
    /// Newline-delimited JSON
    Json,
}

// Default value functions

fn default_generate_id() -> bool {
    true
}

fn default_memory_cap_ratio() -> f32 {
    0.8
}

fn default_slots_per_queue() -> usize {
    1024
}

fn default_numa_affinity() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timestamps() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !(self.service.memory_cap_ratio > 0.0 && self.service.memory_cap_ratio <= 1.0) {
            return Err(format!(
                "memory_cap_ratio ({}) must be in (0, 1]",
                self.service.memory_cap_ratio
            )
            .into());
        }

        if self.workers.slots_per_queue == 0 {
            return Err("slots_per_queue must be at least 1".into());
        }

        if self.workers.queues == Some(0) {
            return Err("queues must be at least 1".into());
        }

        Ok(())
    }

    /// Get the number of worker queues.
    pub fn queues(&self) -> usize {
        self.workers.queues.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.service.memory_size_mb, 0);
        assert!(config.service.generate_id);
        assert_eq!(config.workers.slots_per_queue, 1024);
        assert!(config.workers.numa_affinity);
        assert!(config.queues() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [service]
            memory_size_mb = 512
            spill_root = "/tmp/rowcache"
            generate_id = false

            [workers]
            queues = 4
            numa_affinity = false

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.service.memory_size_mb, 512);
        assert!(!config.service.generate_id);
        assert_eq!(config.queues(), 4);
        assert!(!config.workers.numa_affinity);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str("[service]\nbogus = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.service.memory_cap_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workers.slots_per_queue = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workers.queues = Some(0);
        assert!(config.validate().is_err());
    }
}
