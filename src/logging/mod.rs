// Structured logging setup
use tracing::info;
use tracing_subscriber::{
    fmt::time::UtcTime,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::{LogFormat, LoggingConfig};

/// Logging manager
pub struct LoggingManager {
    config: LoggingConfig,
}

impl LoggingManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Override the configured level, e.g. from the command line
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    fn filter(&self) -> EnvFilter {
        // RUST_LOG wins over the configured level
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn initialize(&self) -> Result<(), String> {
        let registry = Registry::default().with(self.filter());

        let result = match self.config.format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(UtcTime::rfc_3339())
                        .with_line_number(self.config.enable_line_numbers),
                )
                .try_init(),
            LogFormat::Compact => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(self.config.enable_colors)
                        .with_timer(UtcTime::rfc_3339())
                        .with_line_number(self.config.enable_line_numbers),
                )
                .try_init(),
            LogFormat::Text => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(self.config.enable_colors)
                        .with_timer(UtcTime::rfc_3339())
                        .with_line_number(self.config.enable_line_numbers),
                )
                .try_init(),
        };
        result.map_err(|e| e.to_string())?;

        info!("Logging system initialized with level: {}", self.config.level);
        Ok(())
    }
}
