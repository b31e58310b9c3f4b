use crate::scanner::ResultSink;
use async_trait::async_trait;
use certwatch_common::types::ScanAttempt;
use certwatch_storage::ScanStore;
use chrono::Utc;
use std::sync::Arc;

/// [`ResultSink`] backed by the SQLite scan store. Each flush writes the
/// batch and advances `last_scanned` in a single transaction.
pub struct StoreSink {
    store: Arc<ScanStore>,
}

impl StoreSink {
    pub fn new(store: Arc<ScanStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResultSink for StoreSink {
    async fn persist(&self, attempts: &[ScanAttempt]) -> anyhow::Result<usize> {
        if attempts.is_empty() {
            return Ok(0);
        }
        let written = self.store.persist_batch(attempts, Utc::now())?;
        tracing::debug!(
            batch = attempts.len(),
            written = written,
            "Persisted scan batch"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certwatch_common::types::{ScanStatus, ScanAttempt};

    fn setup() -> (Arc<ScanStore>, StoreSink) {
        certwatch_common::id::init(1, 1);
        let store = Arc::new(ScanStore::open_in_memory().unwrap());
        let sink = StoreSink::new(Arc::clone(&store));
        (store, sink)
    }

    #[tokio::test]
    async fn persists_batch_and_reads_back_history() {
        let (store, sink) = setup();
        let domain = store.insert_domain("example.com").unwrap();

        let attempt = ScanAttempt {
            domain_id: domain.id,
            hostname: domain.hostname.clone(),
            scanned_at: Utc::now(),
            status: ScanStatus::Failed,
            facts: None,
            error: Some("Connection timed out after 10s".into()),
            http_status: None,
            elapsed_ms: 10_042,
        };

        let written = sink.persist(std::slice::from_ref(&attempt)).await.unwrap();
        assert_eq!(written, 1);

        let history = store.scan_history(domain.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ScanStatus::Failed);

        let refreshed = store.get_domain_by_id(domain.id).unwrap().unwrap();
        assert!(refreshed.last_scanned.is_some());
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let (_store, sink) = setup();
        assert_eq!(sink.persist(&[]).await.unwrap(), 0);
    }
}
