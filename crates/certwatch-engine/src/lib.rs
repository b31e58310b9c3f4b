//! Concurrent TLS certificate scan engine.
//!
//! The engine periodically probes every active domain, extracts certificate
//! facts from the presented leaf, and bulk-persists results through
//! [`certwatch_storage::ScanStore`]. Probes are retry-wrapped
//! ([`retry::RetryPolicy`]), semaphore-bounded and batched
//! ([`scanner::BatchScanner`]), and driven by a single
//! [`scheduler::ScanScheduler`] loop that also honors an out-of-band
//! immediate-scan trigger.

pub mod config;
pub mod handle;
pub mod probe;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod secondary;
pub mod sink;
