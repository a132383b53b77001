use std::sync::Arc;

use anyhow::{Context, Result};
use mango_admin::connection::MongoRegistry;
use mango_admin::state::{AdminCommands, ConfigManager};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    log::info!(
        "mango-admin {} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("MANGO_ADMIN_GIT_SHA").filter(|sha| !sha.is_empty()).unwrap_or("unknown")
    );

    let config = ConfigManager::new()?;
    log::info!("Config directory: {}", config.config_dir().display());

    let settings = config.load_settings().unwrap_or_else(|err| {
        log::warn!("Failed to load settings, using defaults: {err:#}");
        Default::default()
    });
    let store = config.connection_store().context("Failed to open connection store")?;

    let registry = Arc::new(MongoRegistry::mongo(settings.timeouts()));
    let commands = AdminCommands::new(registry.clone(), store, settings);
    commands.restore_connections().await;

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    log::info!("Shutting down {} connection(s)", registry.len());
    registry.shutdown_all().await;

    Ok(())
}
