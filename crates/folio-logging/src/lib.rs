//! Console and JSONL file logging for Folio servers
//!
//! # Quick Start
//!
//! ```ignore
//! use folio_logging::{FolioSubscriberBuilder, LogConfig};
//!
//! // JSONL to console
//! let _guard = FolioSubscriberBuilder::new().init();
//!
//! // Rotated JSONL files; keep the guard alive until exit
//! let _guard = FolioSubscriberBuilder::new()
//!     .with_config(LogConfig::production("/var/log/folio".into()))
//!     .init();
//! ```
//!
//! `RUST_LOG` overrides the configured levels. Usage events are emitted
//! under the `folio::usage` target.

pub mod config;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use tracing_appender::non_blocking::WorkerGuard;

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::layers::BoxedLayer;

/// Errors while setting up logging
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to open log output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to create rolling log file: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("A global subscriber is already set: {0}")]
    AlreadyInitialized(String),
}

/// Builder for configuring and initializing the logging subscriber
///
/// By default, console output uses JSONL format. Use
/// [`LogConfig::development()`] for human-readable output.
#[derive(Debug, Clone, Default)]
pub struct FolioSubscriberBuilder {
    config: LogConfig,
}

impl FolioSubscriberBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Override the level of one target
    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.config.filters = self.config.filters.with_target(target, level);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.config.directives()))
    }

    fn layers(&self) -> Result<(Vec<BoxedLayer>, Option<WorkerGuard>), LoggingError> {
        let mut layers = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            layers.push(if self.config.console.pretty {
                layers::pretty_layer(self.config.console.ansi)
            } else {
                layers::jsonl_layer(std::io::stdout, &self.config.jsonl)
            });
        }
        if let Some(file) = &self.config.file {
            let (writer, file_guard) = layers::file_writer(file)?;
            layers.push(layers::jsonl_layer(writer, &self.config.jsonl));
            guard = Some(file_guard);
        }
        Ok((layers, guard))
    }

    /// Install the subscriber globally
    ///
    /// Keep the returned guard alive for the duration of the program when
    /// file output is enabled.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (layers, guard) = self.layers()?;
        Registry::default()
            .with(layers)
            .with(self.env_filter())
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
        Ok(guard)
    }

    /// Like [`Self::try_init`], reporting failures on stderr instead
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: logging not initialized: {e}");
                None
            }
        }
    }

    /// Install the subscriber for the current thread only
    pub fn set_default(self) -> Result<(DefaultGuard, Option<WorkerGuard>), LoggingError> {
        let (layers, guard) = self.layers()?;
        let subscriber = Registry::default().with(layers).with(self.env_filter());
        Ok((tracing::subscriber::set_default(subscriber), guard))
    }
}

/// Initialize logging with default settings (JSONL to console)
pub fn init_default() {
    FolioSubscriberBuilder::new().init();
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() {
    FolioSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init();
}

/// Initialize logging for testing; a second call is a no-op
pub fn init_testing() {
    let _ = FolioSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
