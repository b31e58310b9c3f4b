use crate::probe::Probe;
use crate::retry::{probe_with_retry, RetryPolicy};
use crate::secondary::SecondaryCheck;
use async_trait::async_trait;
use certwatch_common::types::{Domain, ScanAttempt, ScanRunSummary, ScanStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

/// Destination for completed scan attempts. The scanner flushes once per
/// batch; a flush error is logged and the run continues.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, attempts: &[ScanAttempt]) -> anyhow::Result<usize>;
}

/// Scans a set of domains concurrently, bounded by a semaphore, and feeds
/// results to a [`ResultSink`] in batches.
pub struct BatchScanner {
    probe: Arc<dyn Probe>,
    sink: Arc<dyn ResultSink>,
    secondary: Option<Arc<dyn SecondaryCheck>>,
    retry: RetryPolicy,
    limiter: Arc<Semaphore>,
    batch_size: usize,
    port: u16,
}

impl BatchScanner {
    pub fn new(
        probe: Arc<dyn Probe>,
        sink: Arc<dyn ResultSink>,
        retry: RetryPolicy,
        max_concurrent: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            probe,
            sink,
            secondary: None,
            retry,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            batch_size: batch_size.max(1),
            port: 443,
        }
    }

    /// Attach a follow-up check whose result is recorded alongside
    /// successful scans.
    pub fn with_secondary(mut self, secondary: Arc<dyn SecondaryCheck>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Scan every domain in `domains` and return the run summary.
    ///
    /// Domains are processed in batches of `batch_size`; within a batch all
    /// probes run concurrently up to the semaphore limit, and the batch is
    /// persisted as a whole before the next one starts. When `shutdown`
    /// flips, in-flight probes finish and already-completed results are
    /// still flushed, but no new batch begins.
    pub async fn scan(
        &self,
        domains: &[Domain],
        shutdown: &watch::Receiver<bool>,
    ) -> ScanRunSummary {
        let mut summary = ScanRunSummary::begin(Utc::now());
        tracing::info!(total = domains.len(), "Starting certificate scan");

        for batch in domains.chunks(self.batch_size) {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested, stopping scan early");
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for domain in batch {
                let permit = match self.limiter.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let probe = Arc::clone(&self.probe);
                let secondary = self.secondary.clone();
                let retry = self.retry;
                let port = self.port;
                let domain = domain.clone();
                let mut shutdown = shutdown.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let started = tokio::time::Instant::now();
                    let outcome =
                        probe_with_retry(probe.as_ref(), &domain.hostname, port, retry, &mut shutdown)
                            .await;
                    let elapsed_ms = started.elapsed().as_millis() as u64;

                    match outcome.result {
                        Ok(facts) => {
                            let http_status = match &secondary {
                                Some(check) => check.check(&domain.hostname).await,
                                None => None,
                            };
                            tracing::debug!(
                                domain = %domain.hostname,
                                days_until_expiry = facts.days_until_expiry,
                                attempts = outcome.attempts,
                                "Scan succeeded"
                            );
                            ScanAttempt {
                                domain_id: domain.id,
                                hostname: domain.hostname,
                                scanned_at: Utc::now(),
                                status: ScanStatus::Valid,
                                facts: Some(facts),
                                error: None,
                                http_status,
                                elapsed_ms,
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                domain = %domain.hostname,
                                error = %err,
                                attempts = outcome.attempts,
                                "Scan failed"
                            );
                            ScanAttempt {
                                domain_id: domain.id,
                                hostname: domain.hostname,
                                scanned_at: Utc::now(),
                                status: err.status(),
                                facts: None,
                                error: Some(err.message),
                                http_status: None,
                                elapsed_ms,
                            }
                        }
                    }
                }));
            }

            let mut attempts = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(attempt) => {
                        summary.record(&attempt);
                        attempts.push(attempt);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Scan task panicked");
                    }
                }
            }

            if let Err(e) = self.sink.persist(&attempts).await {
                tracing::error!(
                    error = %e,
                    batch_size = attempts.len(),
                    "Failed to persist scan batch"
                );
            }
        }

        summary.finish(Utc::now());
        tracing::info!(
            total = summary.total_domains,
            valid = summary.valid_count,
            invalid = summary.invalid_count,
            failed = summary.failed_count,
            expiring_soon = summary.expiring_soon_count,
            duration_secs = summary.duration_secs,
            "Certificate scan finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Probe, ProbeError};
    use certwatch_common::types::CertificateFacts;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn make_domains(n: usize) -> Vec<Domain> {
        let now = Utc::now();
        (0..n)
            .map(|i| Domain {
                id: i as i64 + 1,
                hostname: format!("host{i}.example.com"),
                is_active: true,
                last_scanned: None,
                next_scan: None,
                created_at: now,
                updated_at: now,
            })
            .collect()
    }

    fn valid_facts(days: i64) -> CertificateFacts {
        let now = Utc::now();
        CertificateFacts {
            common_name: Some("example.com".into()),
            san_list: vec![],
            issuer: "CN=issuer".into(),
            subject: "CN=example.com".into(),
            serial_number: "01".into(),
            not_before: now - chrono::Duration::days(1),
            not_after: now + chrono::Duration::days(days),
            self_signed: false,
            key_bits: Some(2048),
            signature_algorithm: "SHA256withRSA".into(),
            is_valid: true,
            days_until_expiry: days,
        }
    }

    /// Probe that tracks the number of concurrently running calls.
    struct ConcurrencyProbe {
        current: AtomicI32,
        peak: AtomicI32,
    }

    impl ConcurrencyProbe {
        fn new() -> Self {
            Self {
                current: AtomicI32::new(0),
                peak: AtomicI32::new(0),
            }
        }
    }

    #[async_trait]
    impl Probe for ConcurrencyProbe {
        async fn probe(&self, _h: &str, _p: u16) -> Result<CertificateFacts, ProbeError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(valid_facts(90))
        }
    }

    /// Probe whose result depends on the hostname prefix.
    struct MappingProbe;

    #[async_trait]
    impl Probe for MappingProbe {
        async fn probe(&self, hostname: &str, _p: u16) -> Result<CertificateFacts, ProbeError> {
            if hostname.starts_with("host0") {
                Err(ProbeError::rejected("Certificate verification failed"))
            } else if hostname.starts_with("host1") {
                Err(ProbeError::permanent("No peer certificates"))
            } else {
                Ok(valid_facts(3))
            }
        }
    }

    /// Sink that records each flush.
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
        attempts: Mutex<Vec<ScanAttempt>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn persist(&self, attempts: &[ScanAttempt]) -> anyhow::Result<usize> {
            self.batches.lock().unwrap().push(attempts.len());
            self.attempts.lock().unwrap().extend_from_slice(attempts);
            Ok(attempts.len())
        }
    }

    /// Sink that always fails.
    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResultSink for FailingSink {
        async fn persist(&self, _attempts: &[ScanAttempt]) -> anyhow::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("database unavailable")
        }
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let probe = Arc::new(ConcurrencyProbe::new());
        let sink = Arc::new(RecordingSink::default());
        let scanner = BatchScanner::new(
            probe.clone(),
            sink,
            RetryPolicy::default(),
            4,
            100,
        );

        let (_tx, rx) = no_shutdown();
        let summary = scanner.scan(&make_domains(40), &rx).await;

        assert_eq!(summary.total_domains, 40);
        assert_eq!(summary.valid_count, 40);
        assert!(probe.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn domains_are_persisted_in_sequential_batches() {
        let probe = Arc::new(ConcurrencyProbe::new());
        let sink = Arc::new(RecordingSink::default());
        let scanner = BatchScanner::new(
            probe,
            sink.clone(),
            RetryPolicy::default(),
            50,
            1000,
        );

        let (_tx, rx) = no_shutdown();
        let summary = scanner.scan(&make_domains(5000), &rx).await;

        assert_eq!(summary.total_domains, 5000);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.as_slice(), &[1000, 1000, 1000, 1000, 1000]);
    }

    #[tokio::test]
    async fn statuses_map_to_outcomes() {
        let sink = Arc::new(RecordingSink::default());
        let scanner = BatchScanner::new(
            Arc::new(MappingProbe),
            sink.clone(),
            RetryPolicy::default(),
            8,
            100,
        );

        // host0 rejected, host1 permanent failure, host2..host4 valid with
        // three days to expiry.
        let (_tx, rx) = no_shutdown();
        let summary = scanner.scan(&make_domains(5), &rx).await;

        assert_eq!(summary.valid_count, 3);
        assert_eq!(summary.invalid_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.expiring_soon_count, 3);

        let attempts = sink.attempts.lock().unwrap();
        let rejected = attempts
            .iter()
            .find(|a| a.hostname == "host0.example.com")
            .unwrap();
        assert_eq!(rejected.status, ScanStatus::Invalid);
        assert!(rejected.facts.is_none());
        assert!(rejected.error.is_some());
    }

    #[tokio::test]
    async fn failing_sink_does_not_abort_the_run() {
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let scanner = BatchScanner::new(
            Arc::new(ConcurrencyProbe::new()),
            sink.clone(),
            RetryPolicy::default(),
            8,
            10,
        );

        let (_tx, rx) = no_shutdown();
        let summary = scanner.scan(&make_domains(30), &rx).await;

        assert_eq!(summary.total_domains, 30);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_stops_before_next_batch() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(false);
        let _ = tx.send(true);
        let scanner = BatchScanner::new(
            Arc::new(ConcurrencyProbe::new()),
            sink.clone(),
            RetryPolicy::default(),
            8,
            10,
        );

        let summary = scanner.scan(&make_domains(30), &rx).await;

        assert_eq!(summary.total_domains, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    struct FixedStatusCheck(u16);

    #[async_trait]
    impl SecondaryCheck for FixedStatusCheck {
        async fn check(&self, _hostname: &str) -> Option<u16> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn secondary_check_status_is_recorded_for_valid_scans() {
        let sink = Arc::new(RecordingSink::default());
        let scanner = BatchScanner::new(
            Arc::new(MappingProbe),
            sink.clone(),
            RetryPolicy::default(),
            8,
            100,
        )
        .with_secondary(Arc::new(FixedStatusCheck(200)));

        let (_tx, rx) = no_shutdown();
        scanner.scan(&make_domains(3), &rx).await;

        let attempts = sink.attempts.lock().unwrap();
        for attempt in attempts.iter() {
            match attempt.status {
                ScanStatus::Valid => assert_eq!(attempt.http_status, Some(200)),
                _ => assert_eq!(attempt.http_status, None),
            }
        }
    }

    #[tokio::test]
    async fn empty_domain_list_yields_empty_summary() {
        let sink = Arc::new(RecordingSink::default());
        let scanner = BatchScanner::new(
            Arc::new(ConcurrencyProbe::new()),
            sink.clone(),
            RetryPolicy::default(),
            8,
            10,
        );

        let (_tx, rx) = no_shutdown();
        let summary = scanner.scan(&[], &rx).await;
        assert_eq!(summary.total_domains, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
    }
}
