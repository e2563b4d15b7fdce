//! Daemon command: tick the scheduler until interrupted.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::bootstrap;
use crate::config::Settings;
use crate::db::Database;
use crate::error::AppError;

/// Run the scheduler loop until SIGINT.
pub async fn run(settings: Settings) -> Result<(), AppError> {
    let config = settings.load_config()?;
    let db = Arc::new(Database::open(&settings.db_path)?);

    bootstrap::ensure_cleanup_job(&db).await?;
    let engine = bootstrap::build(db, &settings, &config)?;

    info!(
        db = %settings.db_path,
        workers = settings.workers,
        tick_secs = settings.tick_interval.as_secs(),
        hash_strength = %settings.hash_strength,
        "starting conduit daemon"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    engine
        .scheduler
        .run_loop(settings.tick_interval, shutdown_rx)
        .await;

    drop(shutdown_tx);
    info!("conduit daemon stopped");
    Ok(())
}
