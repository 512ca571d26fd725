use anyhow::Context;
use tracing::info;

use carlos::config::AppConfig;
use carlos::logging;
use carlos::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("initializing logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %format!("{}:{}", config.bind_address, config.port),
        "carlos starting"
    );

    let container = ServiceContainer::new(config)
        .await
        .context("initializing services")?
        .with_logging_config(logging_config);

    container
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("carlos stopped");
    Ok(())
}
