//! Tunables for the batch processor and the periodic reader.
//!
//! Defaults and environment variable names follow the OpenTelemetry SDK
//! conventions. Values are validated when a processor or reader is built.

use std::fmt::{Display, Error as FmtError, Formatter};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 2048;
pub const DEFAULT_SCHEDULED_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
pub const DEFAULT_MAX_EXPORT_TIMEOUT: Duration = Duration::from_millis(30_000);

pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_millis(60_000);
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_millis(30_000);

const ENV_MAX_QUEUE_SIZE: &str = "OTEL_BSP_MAX_QUEUE_SIZE";
const ENV_SCHEDULE_DELAY: &str = "OTEL_BSP_SCHEDULE_DELAY";
const ENV_MAX_EXPORT_BATCH_SIZE: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";
const ENV_EXPORT_TIMEOUT: &str = "OTEL_BSP_EXPORT_TIMEOUT";
const ENV_METRIC_EXPORT_INTERVAL: &str = "OTEL_METRIC_EXPORT_INTERVAL";
const ENV_METRIC_EXPORT_TIMEOUT: &str = "OTEL_METRIC_EXPORT_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroQueueSize,
    ZeroBatchSize,
    BatchLargerThanQueue { batch: usize, queue: usize },
    ZeroTimeout,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            ConfigError::ZeroQueueSize => write!(f, "max queue size must be non-zero"),
            ConfigError::ZeroBatchSize => write!(f, "max export batch size must be non-zero"),
            ConfigError::BatchLargerThanQueue { batch, queue } => write!(
                f,
                "max export batch size ({batch}) must not exceed max queue size ({queue})"
            ),
            ConfigError::ZeroTimeout => write!(f, "timeouts must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for a `BatchProcessor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Records queued beyond this are dropped.
    pub max_queue_size: usize,
    /// How long the worker waits between exports when the queue does not
    /// reach a full batch. Zero disables timed exports.
    pub scheduled_delay: Duration,
    pub max_export_batch_size: usize,
    /// The default deadline for flush and shutdown, also passed to the
    /// exporter on shutdown.
    pub max_export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> BatchConfig {
        BatchConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            scheduled_delay: DEFAULT_SCHEDULED_DELAY,
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            max_export_timeout: DEFAULT_MAX_EXPORT_TIMEOUT,
        }
    }
}

impl BatchConfig {
    /// The defaults, overridden by any `OTEL_BSP_*` environment variables.
    pub fn from_env() -> BatchConfig {
        let mut config = BatchConfig::default();

        if let Some(size) = env_value::<usize>(ENV_MAX_QUEUE_SIZE) {
            config.max_queue_size = size;
        }
        if let Some(ms) = env_value::<u64>(ENV_SCHEDULE_DELAY) {
            config.scheduled_delay = Duration::from_millis(ms);
        }
        if let Some(size) = env_value::<usize>(ENV_MAX_EXPORT_BATCH_SIZE) {
            config.max_export_batch_size = size;
        }
        if let Some(ms) = env_value::<u64>(ENV_EXPORT_TIMEOUT) {
            config.max_export_timeout = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_max_queue_size(mut self, size: usize) -> BatchConfig {
        self.max_queue_size = size;
        self
    }

    pub fn with_scheduled_delay(mut self, delay: Duration) -> BatchConfig {
        self.scheduled_delay = delay;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> BatchConfig {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_max_export_timeout(mut self, timeout: Duration) -> BatchConfig {
        self.max_export_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.max_export_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.max_export_batch_size > self.max_queue_size {
            return Err(ConfigError::BatchLargerThanQueue {
                batch: self.max_export_batch_size,
                queue: self.max_queue_size,
            });
        }
        if self.max_export_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }
}

/// Configuration for a `PeriodicReader`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Time between collections. Zero means collections only happen on
    /// `force_flush` and `shutdown`.
    pub export_interval: Duration,
    pub export_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> ReaderConfig {
        ReaderConfig {
            export_interval: DEFAULT_EXPORT_INTERVAL,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
        }
    }
}

impl ReaderConfig {
    /// The defaults, overridden by any `OTEL_METRIC_EXPORT_*` environment
    /// variables.
    pub fn from_env() -> ReaderConfig {
        let mut config = ReaderConfig::default();

        if let Some(ms) = env_value::<u64>(ENV_METRIC_EXPORT_INTERVAL) {
            config.export_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>(ENV_METRIC_EXPORT_TIMEOUT) {
            config.export_timeout = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_export_interval(mut self, interval: Duration) -> ReaderConfig {
        self.export_interval = interval;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> ReaderConfig {
        self.export_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.export_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;

    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring invalid value for {name}: {raw:?}");
            None
        }
    }
}
