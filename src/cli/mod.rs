// Command line interface
use std::net::SocketAddr;
use std::path::PathBuf;
use clap::{Parser, Subcommand, ValueEnum};

use crate::config::AppConfig;

/// yt-cipher gateway CLI
#[derive(Parser, Debug)]
#[command(name = "yt-cipher-rs")]
#[command(about = "Caching gateway for player script signature decryption")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, global = true)]
    pub bind: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Number of solver workers
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the HTTP gateway (default)
    Serve,

    /// Print the effective configuration
    CheckConfig {
        #[arg(long, value_enum, default_value = "yaml")]
        format: OutputFormat,
    },

    /// Delete every cached player script and derivative
    ClearCache,
}

/// Output formats
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }

    /// Apply command line overrides on top of the loaded configuration.
    /// `--log-level` is applied when logging is initialized.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(workers) = self.workers {
            config.worker.pool_size = workers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::parse_from(["yt-cipher-rs"]);
        assert_eq!(cli.command(), Commands::Serve);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "yt-cipher-rs",
            "--bind",
            "127.0.0.1:9000",
            "--workers",
            "2",
            "--log-level",
            "debug",
            "check-config",
            "--format",
            "json",
        ]);

        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.server.bind_address.port(), 9000);
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            cli.command(),
            Commands::CheckConfig {
                format: OutputFormat::Json
            }
        );
    }
}
