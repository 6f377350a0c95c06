// yt-cipher gateway binary
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use yt_cipher_rs::{
    cli::{Cli, Commands, OutputFormat},
    config::{manager::{render, ConfigManager}, AppConfig},
    gateway::{self, AppContext},
    logging::LoggingManager,
    worker::CommandEngine,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let manager = ConfigManager::new(path.clone());
            manager.load().await.map_err(|e| e as Box<dyn std::error::Error>)?;
            manager.get_config().await
        }
        None => AppConfig::default(),
    };
    cli.apply_overrides(&mut config);

    match cli.command() {
        Commands::CheckConfig { format } => {
            let rendered = render(&config, format == OutputFormat::Json)
                .map_err(|e| e as Box<dyn std::error::Error>)?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::ClearCache => {
            let dir = &config.cache.cache_dir;
            if tokio::fs::try_exists(dir).await? {
                tokio::fs::remove_dir_all(dir).await?;
                println!("Removed cache directory {}", dir.display());
            } else {
                println!("Cache directory {} does not exist", dir.display());
            }
            Ok(())
        }
        Commands::Serve => serve(config, cli.log_level).await,
    }
}

async fn serve(
    config: AppConfig,
    log_level: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut logging = LoggingManager::new(config.logging.clone());
    if let Some(level) = log_level {
        logging = logging.with_level(level);
    }
    logging.initialize()?;

    info!("🚀 Starting yt-cipher gateway v{}", env!("CARGO_PKG_VERSION"));

    let engine = CommandEngine::from_command_line(&config.worker.engine_command)
        .ok_or("worker.engine_command must name a program")?;
    info!("Solver command: {}", config.worker.engine_command.join(" "));

    let ctx = Arc::new(AppContext::bootstrap(config, Arc::new(engine))?);
    ctx.start_maintenance();

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("🛑 Received shutdown signal"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    };

    if let Err(e) = gateway::serve(ctx.clone(), shutdown).await {
        error!("Server error: {}", e);
    }

    info!("🔄 Starting graceful shutdown...");
    ctx.shutdown().await;
    info!("✅ Shutdown complete");
    Ok(())
}
