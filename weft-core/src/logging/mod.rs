//! Logging subsystem
//!
//! A thin layer over `tracing-subscriber`: level and format come from
//! [`LogConfig`], and the returned [`LogHandle`] can swap the active filter
//! at runtime, which is what backs the shell's `debug on|off` command.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Configuration for the logging subsystem.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// The minimum log level to display.
    pub level: LogLevel,
    /// Whether to include target module information.
    pub with_target: bool,
    /// Whether to use JSON formatting.
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }
}

/// Handle onto the installed subscriber; keeps the filter reloadable.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Toggle debug-level output at runtime.
    pub fn set_debug(&self, enabled: bool) -> Result<(), LoggingError> {
        let directive = if enabled { "debug" } else { "info" };
        self.filter
            .reload(EnvFilter::new(directive))
            .map_err(|e| LoggingError::ReloadFailed(e.to_string()))
    }
}

/// Initialize logging with the default configuration.
pub fn init_logging() -> Result<LogHandle, LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Initialize logging with a custom configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging_with_config(config: LogConfig) -> Result<LogHandle, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let fmt_layer = fmt::layer().with_target(config.with_target);
    let registry = tracing_subscriber::registry().with(filter_layer);

    if config.json_format {
        registry
            .with(fmt_layer.json())
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    } else {
        registry
            .with(fmt_layer)
            .try_init()
            .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
    }

    Ok(LogHandle { filter: handle })
}
