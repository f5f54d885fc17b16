//! Runtime Configuration
//!
//! Configuration for the scheduler and logger. Settings can be provided
//! programmatically through the builder or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `BOC_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BOC_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `BOC_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `BOC_SPIN_TIMEOUT_US` | Spin time before a worker pauses, in microseconds | 500 |
//! | `BOC_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//! | `BOC_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use boc_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env()?;
//!
//! // Or use the builder
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .work_stealing(true)
//!     .build();
//! ```

use std::env;
use std::fmt;
use std::time::Duration;

use crate::log::{LogFormat, LogLevel};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Enable work stealing between workers.
    /// Default: true.
    pub work_stealing: bool,

    /// How long an idle worker spins looking for work before it attempts
    /// to pause. Default: 500 microseconds.
    pub spin_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            work_stealing: true,
            spin_timeout: Duration::from_micros(500),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Minimum log level.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

/// Full runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `BOC_*` environment variables.
    ///
    /// Unset variables fall back to defaults; set-but-invalid values are
    /// an error rather than a silent default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = read_env("BOC_NUM_WORKERS") {
            config.scheduler.num_workers = parse_var("BOC_NUM_WORKERS", &v)?;
            if config.scheduler.num_workers == 0 {
                return Err(ConfigError::invalid("BOC_NUM_WORKERS", &v));
            }
        }
        if let Some(v) = read_env("BOC_WORK_STEALING") {
            config.scheduler.work_stealing = parse_bool("BOC_WORK_STEALING", &v)?;
        }
        if let Some(v) = read_env("BOC_SPIN_TIMEOUT_US") {
            let micros: u64 = parse_var("BOC_SPIN_TIMEOUT_US", &v)?;
            config.scheduler.spin_timeout = Duration::from_micros(micros);
        }
        if let Some(v) = read_env("BOC_LOG_LEVEL") {
            config.log.level =
                LogLevel::parse(&v).ok_or_else(|| ConfigError::invalid("BOC_LOG_LEVEL", &v))?;
        }
        if let Some(v) = read_env("BOC_LOG_FORMAT") {
            config.log.format =
                LogFormat::parse(&v).ok_or_else(|| ConfigError::invalid("BOC_LOG_FORMAT", &v))?;
        }

        Ok(config)
    }

    /// Apply the logging settings to the global logger.
    pub fn apply_log_settings(&self) {
        crate::log::set_level(self.log.level);
        crate::log::set_format(self.log.format);
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set the idle spin timeout.
    pub fn spin_timeout(mut self, timeout: Duration) -> Self {
        self.config.scheduler.spin_timeout = timeout;
        self
    }

    /// Set the minimum log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log output format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { var, value } => {
                write!(f, "invalid value for {}: {:?}", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn read_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(var, value))
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, value)),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
