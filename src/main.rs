use brickpilot::app::App;
use brickpilot::config::{self, BrickConfig};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = config::config_path().map_err(|e| eyre!("Failed to locate configuration: {}", e))?;
    let created = config::ensure_default_config(&path)
        .await
        .map_err(|e| eyre!("Failed to write default configuration: {}", e))?;
    let config = BrickConfig::load(&path)
        .await
        .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e))?;

    let level = config
        .logging
        .tracing_level()
        .map_err(|e| eyre!("Invalid logging configuration: {}", e))?;
    setup_logging_env(level);

    if created {
        info!("Created default configuration at {}", path.display());
    }
    info!("Loaded configuration from {}", path.display());

    let app = App::build(config).map_err(|e| eyre!("Failed to assemble system: {}", e))?;
    let mut running = app
        .start()
        .await
        .map_err(|e| eyre!("Failed to start system: {}", e))?;

    if let Some(addr) = running.stream_addr() {
        info!("Streaming attributes on {}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to wait for Ctrl-C: {}", e))?;
    info!("Ctrl-C received, shutting down");

    running.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
