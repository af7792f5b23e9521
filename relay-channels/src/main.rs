//! Relay Channels - Main entry point.

use anyhow::Result;
use relay_channels::start;
use relay_common::config::Config;
use relay_common::logging::init_logging;
use relay_common::Validate;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Relay Channels v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        tracing::warn!(error = %e, "Configuration problems found, continuing");
    }
    tracing::info!(
        api_base = %config.dify.api_base,
        app_type = %config.dify.app_type,
        "Using Dify app"
    );

    start(&config).await
}
