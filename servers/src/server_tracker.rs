use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;

mod tracker_logic;
use tracker_logic::{config, downstream, logger, pipeline::Pipeline};

/// How long the HTTP server gets to drain before the pipeline is torn down anyway.
const SERVER_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    logger::setup_logging(&log_dir, &log_level)?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let pipeline = Pipeline::new(&config)?;
    pipeline.start()?;

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        pipeline.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    // Server first, then the pipeline from the producers down.
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SERVER_DRAIN, downstream_handle).await {
        Ok(Ok(Err(e))) => log::error!("Downstream server failed: {}", e),
        Ok(Err(e)) => log::error!("Downstream server panicked: {}", e),
        Err(_) => log::warn!("Downstream server did not drain in time"),
        Ok(Ok(Ok(()))) => {}
    }
    pipeline.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Could not install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
