use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rss_digest::config::Config;
use rss_digest::db::Database;
use rss_digest::pipeline::Pipeline;
use rss_digest::runner::{start_scheduler, Runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rss_digest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("RSS_DIGEST_CONFIG").unwrap_or_else(|_| "digest.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {} users and {} groups from {}",
        config.users.len(),
        config.groups.len(),
        config_path
    );

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database_url.clone());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    db.sync_config(&config).await?;
    info!("Database initialized");

    let db = Arc::new(db);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Pipeline::from_config(db.clone(), &config)?.with_shutdown(shutdown_rx.clone());
    let runner = Arc::new(Runner::new(db.clone(), Arc::new(pipeline)));

    let interval = Duration::from_secs(config.tick_interval_secs.max(1));
    let scheduler = tokio::spawn(start_scheduler(runner, interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;
    scheduler.await?;

    Ok(())
}
