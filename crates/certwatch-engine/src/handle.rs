use crate::scheduler::ScanTrigger;
use certwatch_common::types::ScanRunSummary;
use certwatch_storage::{Result, ScanResultRow, ScanStore};
use std::sync::Arc;

/// Cheap, cloneable handle for interacting with a running engine:
/// request scans and read back results without touching the scheduler.
#[derive(Clone)]
pub struct EngineHandle {
    store: Arc<ScanStore>,
    trigger: Arc<ScanTrigger>,
}

impl EngineHandle {
    pub fn new(store: Arc<ScanStore>, trigger: Arc<ScanTrigger>) -> Self {
        Self { store, trigger }
    }

    /// Request a scan ahead of the regular schedule. Returns false when
    /// a request was already pending.
    pub fn trigger_immediate_scan(&self) -> bool {
        let fresh = self.trigger.request();
        if fresh {
            tracing::info!("Immediate scan requested");
        }
        fresh
    }

    pub fn last_run_summary(&self) -> Result<Option<ScanRunSummary>> {
        self.store.last_run_summary()
    }

    pub fn scan_history(&self, domain_id: i64, limit: usize) -> Result<Vec<ScanResultRow>> {
        self.store.scan_history(domain_id, limit)
    }
}
