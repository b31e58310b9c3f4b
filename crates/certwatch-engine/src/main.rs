use anyhow::Context;
use certwatch_engine::config::EngineConfig;
use certwatch_engine::handle::EngineHandle;
use certwatch_engine::probe::CertProbe;
use certwatch_engine::scanner::BatchScanner;
use certwatch_engine::scheduler::{ScanScheduler, ScanTrigger};
use certwatch_engine::secondary::HttpStatusCheck;
use certwatch_engine::sink::StoreSink;
use certwatch_storage::ScanStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Open the scan store, retrying while the data directory or database
/// is still coming up (e.g. a mount appearing after boot).
async fn open_store_with_retry(
    data_dir: &Path,
    max_retries: u32,
    delay: Duration,
) -> anyhow::Result<ScanStore> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match ScanStore::open(data_dir) {
            Ok(store) => return Ok(store),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_retries = max_retries,
                    "Failed to open scan store, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open scan store after {attempt} attempts")
                })
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    EnvFilter::new("certwatch_engine=info,certwatch_storage=info,certwatch_common=info,info")
                }),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("certwatch.toml"));
    let config = EngineConfig::load(&config_path)?;
    tracing::info!(path = %config_path.display(), "Configuration loaded");

    certwatch_common::id::init(config.machine_id, config.node_id);

    let store = Arc::new(
        open_store_with_retry(
            Path::new(&config.data_dir),
            config.boot.max_retries,
            Duration::from_secs(config.boot.retry_delay_secs),
        )
        .await?,
    );

    let probe = Arc::new(CertProbe::new(
        config.scan.connect_timeout_secs,
        config.scan.verify_mode,
    ));
    let sink = Arc::new(StoreSink::new(Arc::clone(&store)));
    let mut scanner = BatchScanner::new(
        probe,
        sink,
        config.retry_policy(),
        config.scan.max_concurrent,
        config.scan.batch_size,
    );
    if config.http_check.enabled {
        scanner = scanner.with_secondary(Arc::new(HttpStatusCheck::new(
            config.http_check.timeout_secs,
        )?));
    }

    let trigger = Arc::new(ScanTrigger::new());
    let handle = EngineHandle::new(Arc::clone(&store), Arc::clone(&trigger));

    let scheduler = ScanScheduler::new(
        Arc::clone(&store),
        scanner,
        trigger,
        Duration::from_secs(config.schedule.interval_secs),
        Duration::from_secs(config.schedule.poll_secs),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    // Dropping a file named `scan.trigger` into the data directory
    // requests an immediate scan.
    let trigger_path = Path::new(&config.data_dir).join("scan.trigger");
    let poll = Duration::from_secs(config.schedule.poll_secs);
    let mut watcher_shutdown = shutdown_rx;
    let watcher_task = tokio::spawn(async move {
        loop {
            if trigger_path.exists() {
                if let Err(e) = std::fs::remove_file(&trigger_path) {
                    tracing::warn!(error = %e, "Failed to remove trigger file");
                } else {
                    handle.trigger_immediate_scan();
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = watcher_shutdown.changed() => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(30), scheduler_task)
        .await
        .is_err()
    {
        tracing::warn!("Scheduler did not stop within 30s, exiting anyway");
    }
    watcher_task.abort();

    tracing::info!("Certificate scan engine stopped");
    Ok(())
}
