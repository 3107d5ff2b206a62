use anyhow::Result;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use dcs_daemon::config;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load();

    let level = if settings.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("DCS_LOG_LEVEL").unwrap_or(level.into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    dcs_daemon::run(settings, shutdown_rx).await?;
    Ok(())
}
