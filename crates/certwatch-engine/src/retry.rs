use crate::probe::{FailureKind, Probe, ProbeError};
use certwatch_common::types::CertificateFacts;
use std::time::Duration;
use tokio::sync::watch;

/// Retry behaviour for transient probe failures.
///
/// Attempt `n` (1-based) sleeps `base * 2^(n-1)` before retrying, until
/// either `max_attempts` attempts have been made or `max_total` wall time
/// would be exceeded. Permanent and rejected failures are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_total: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, max_total: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
            max_total,
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Outcome of a retried probe, with the number of attempts actually made.
pub struct RetryOutcome {
    pub result: Result<CertificateFacts, ProbeError>,
    pub attempts: u32,
}

/// Run `probe` against `hostname:port` honoring `policy`.
///
/// Backoff sleeps race against `shutdown`; when shutdown is signalled the
/// current result is returned immediately rather than retried.
pub async fn probe_with_retry(
    probe: &dyn Probe,
    hostname: &str,
    port: u16,
    policy: RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> RetryOutcome {
    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = probe.probe(hostname, port).await;

        let err = match result {
            Ok(facts) => {
                return RetryOutcome {
                    result: Ok(facts),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        if err.kind != FailureKind::Transient || attempt >= policy.max_attempts {
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.backoff_after(attempt);
        if started.elapsed() + delay >= policy.max_total {
            tracing::debug!(
                domain = %hostname,
                attempts = attempt,
                "Retry budget exhausted"
            );
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
            };
        }

        tracing::debug!(
            domain = %hostname,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Probe failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        calls: AtomicU32,
        succeed_on: u32,
        failure: fn() -> ProbeError,
    }

    impl ScriptedProbe {
        fn failing(failure: fn() -> ProbeError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on: u32::MAX,
                failure,
            }
        }

        fn succeeding_on(succeed_on: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on,
                failure: || ProbeError::transient("Connection timed out"),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn dummy_facts() -> CertificateFacts {
        CertificateFacts {
            common_name: Some("example.com".into()),
            san_list: vec!["example.com".into()],
            issuer: "CN=issuer".into(),
            subject: "CN=example.com".into(),
            serial_number: "01".into(),
            not_before: Utc::now(),
            not_after: Utc::now() + chrono::Duration::days(90),
            self_signed: false,
            key_bits: Some(2048),
            signature_algorithm: "SHA256withRSA".into(),
            is_valid: true,
            days_until_expiry: 89,
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, _hostname: &str, _port: u16) -> Result<CertificateFacts, ProbeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(dummy_facts())
            } else {
                Err((self.failure)())
            }
        }
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(4, Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(policy.backoff_after(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_after(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_after(3), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_up_to_max_attempts() {
        let probe = ScriptedProbe::failing(|| ProbeError::transient("Connection timed out"));
        let (_tx, mut rx) = shutdown_pair();
        let outcome = probe_with_retry(
            &probe,
            "example.com",
            443,
            RetryPolicy::default(),
            &mut rx,
        )
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(probe.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_intermediate_failures() {
        let probe = ScriptedProbe::succeeding_on(2);
        let (_tx, mut rx) = shutdown_pair();
        let outcome = probe_with_retry(
            &probe,
            "example.com",
            443,
            RetryPolicy::default(),
            &mut rx,
        )
        .await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let probe = ScriptedProbe::failing(|| ProbeError::permanent("No peer certificates"));
        let (_tx, mut rx) = shutdown_pair();
        let outcome = probe_with_retry(
            &probe,
            "example.com",
            443,
            RetryPolicy::default(),
            &mut rx,
        )
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_certificates_are_not_retried() {
        let probe =
            ScriptedProbe::failing(|| ProbeError::rejected("Certificate verification failed"));
        let (_tx, mut rx) = shutdown_pair();
        let outcome = probe_with_retry(
            &probe,
            "example.com",
            443,
            RetryPolicy::default(),
            &mut rx,
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.result.unwrap_err().kind,
            FailureKind::Rejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn total_budget_caps_retries() {
        // Second backoff (1s) would push past the 1200ms budget.
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_millis(1200));
        let probe = ScriptedProbe::failing(|| ProbeError::transient("Connection timed out"));
        let (_tx, mut rx) = shutdown_pair();
        let outcome = probe_with_retry(&probe, "example.com", 443, policy, &mut rx).await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let probe = ScriptedProbe::failing(|| ProbeError::transient("Connection timed out"));
        let (tx, mut rx) = shutdown_pair();
        let _ = tx.send(true);
        let outcome = probe_with_retry(
            &probe,
            "example.com",
            443,
            RetryPolicy::default(),
            &mut rx,
        )
        .await;

        // First failure is returned without sleeping through the backoff.
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.is_err());
    }
}
