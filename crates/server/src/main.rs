use anyhow::Result;
use shuttergrid_common::Settings;
use shuttergrid_server::run_server;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = Settings::from_env();
    tracing::info!(
        "starting shuttergrid (pool {}..{}, {} concurrent screenshots)",
        settings.pool.min_size,
        settings.pool.max_size,
        settings.admission.max_concurrent_screenshots
    );

    run_server(settings).await
}
