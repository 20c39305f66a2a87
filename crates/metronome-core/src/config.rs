//! Coordinator configuration file support.
//!
//! Every key has a default, so an empty file (or no file) is a valid
//! configuration. Command-line flags override what the file sets.

use crate::accuracy::PaddingPolicy;
use crate::metrics::MetricCatalog;
use crate::schedule::ScheduleConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Which reduction provider backs a multi-worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedBackend {
    /// Single worker.
    #[default]
    None,
    /// Worker threads of one process.
    Local,
    /// Worker processes joined over TCP, rank 0 hosting.
    Tcp,
}

impl std::str::FromStr for DistributedBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "local" => Ok(Self::Local),
            "tcp" => Ok(Self::Tcp),
            other => Err(ConfigError::InvalidValue(format!("unknown distributed_backend `{other}`"))),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Steps between metric reductions and summary rows.
    pub summary_interval_steps: u64,

    /// Steps between checkpoint saves and metric-log flushes.
    pub checkpoint_interval_steps: u64,

    pub checkpoints_max_to_keep: usize,

    /// Start counting from this step instead of the one recovered from the
    /// metric log.
    pub initial_global_step: Option<u64>,

    pub lr_update_interval_steps: u64,

    pub distributed_backend: DistributedBackend,

    /// Root of the metric log and the checkpoint directory.
    pub output_dir: PathBuf,

    /// File name of the metric log inside `output_dir`.
    pub metric_log_file: String,

    pub metrics: MetricsConfig,

    pub accuracy: PaddingPolicy,

    pub learning_rate: ScheduleConfig,

    pub tcp: TcpConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            summary_interval_steps: 200,
            checkpoint_interval_steps: 1000,
            checkpoints_max_to_keep: 8,
            initial_global_step: None,
            lr_update_interval_steps: 1,
            distributed_backend: DistributedBackend::None,
            output_dir: PathBuf::from("output"),
            metric_log_file: "training_data.csv".to_string(),
            metrics: MetricsConfig::default(),
            accuracy: PaddingPolicy::default(),
            learning_rate: ScheduleConfig::default(),
            tcp: TcpConfig::default(),
        }
    }
}

/// Reduction kinds by metric name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Metrics reduced with SUM; everything else is averaged.
    pub sum: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { sum: vec!["src_tokens".to_string(), "trg_tokens".to_string(), "samples".to_string()] }
    }
}

impl MetricsConfig {
    #[must_use]
    pub fn catalog(&self) -> MetricCatalog {
        MetricCatalog::with_sums(self.sum.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Address rank 0 listens on and the other ranks connect to.
    pub address: String,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:29500".to_string() }
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),

    #[error("failed to read configuration file: {0}")]
    Read(String),

    #[error("failed to parse configuration file: {0}")]
    Parse(String),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl CoordinatorConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (key, value) in [
            ("summary_interval_steps", self.summary_interval_steps),
            ("checkpoint_interval_steps", self.checkpoint_interval_steps),
            ("lr_update_interval_steps", self.lr_update_interval_steps),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{key} must be >= 1")));
            }
        }
        if self.checkpoints_max_to_keep == 0 {
            return Err(ConfigError::InvalidValue("checkpoints_max_to_keep must be >= 1".to_string()));
        }
        if self.metric_log_file.trim().is_empty() {
            return Err(ConfigError::InvalidValue("metric_log_file must not be empty".to_string()));
        }
        self.learning_rate.validate().map_err(ConfigError::InvalidValue)?;
        if self.distributed_backend == DistributedBackend::Tcp {
            self.tcp
                .address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| ConfigError::InvalidValue(format!("tcp.address `{}`: {e}", self.tcp.address)))?;
        }
        Ok(())
    }
}
