use crate::scanner::BatchScanner;
use certwatch_common::types::ScanRunSummary;
use certwatch_storage::ScanStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Coalescing scan trigger. Any number of requests during the cooldown
/// collapse into a single early scan; requests made while a scan is
/// running are discarded when the scan finishes.
#[derive(Debug, Default)]
pub struct ScanTrigger {
    requested: AtomicBool,
}

impl ScanTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an immediate scan. Returns false if one was already pending.
    pub fn request(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    /// Consume a pending request, if any.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Drives full scan cycles: scan all active domains, persist a run
/// summary, then sleep through the cooldown while polling the trigger.
pub struct ScanScheduler {
    store: Arc<ScanStore>,
    scanner: BatchScanner,
    trigger: Arc<ScanTrigger>,
    interval: Duration,
    poll: Duration,
}

impl ScanScheduler {
    pub fn new(
        store: Arc<ScanStore>,
        scanner: BatchScanner,
        trigger: Arc<ScanTrigger>,
        interval: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            store,
            scanner,
            trigger,
            interval,
            poll: poll.max(Duration::from_millis(1)),
        }
    }

    /// Run scan cycles until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            poll_secs = self.poll.as_secs(),
            "Scan scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle(&shutdown).await {
                Ok(Some(summary)) => {
                    tracing::info!(
                        total = summary.total_domains,
                        expiring_soon = summary.expiring_soon_count,
                        "Scan cycle complete"
                    );
                }
                Ok(None) => {
                    tracing::info!("No active domains, skipping scan cycle");
                }
                Err(e) => {
                    // Store unavailable; retry after one poll interval
                    // instead of sleeping through a full cooldown.
                    tracing::error!(error = %e, "Scan cycle failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            }

            if self.cooldown(&mut shutdown).await {
                break;
            }
        }

        tracing::info!("Scan scheduler stopped");
    }

    /// One full scan cycle. Returns `Ok(None)` when there are no active
    /// domains; no run summary is recorded in that case.
    pub async fn run_cycle(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<Option<ScanRunSummary>> {
        // A trigger only ever requests the *next* scan; one arriving
        // while we are already scanning must not cause another run.
        self.trigger.clear();

        let domains = self.store.list_active_domains()?;
        if domains.is_empty() {
            self.trigger.clear();
            return Ok(None);
        }

        let summary = self.scanner.scan(&domains, shutdown).await;
        self.store.insert_run_summary(&summary)?;
        self.trigger.clear();
        Ok(Some(summary))
    }

    /// Sleep until the next cycle is due, waking early on a trigger.
    /// Returns true when shutdown was requested.
    async fn cooldown(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = tokio::time::Instant::now() + self.interval;
        loop {
            if self.trigger.take() {
                tracing::info!("Immediate scan requested, ending cooldown early");
                return false;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            let tick = self.poll.min(deadline - tokio::time::Instant::now());
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => return true,
            }
        }
    }
}
