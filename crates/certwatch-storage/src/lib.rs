//! SQLite persistence for the certificate scan engine.
//!
//! [`scan_store::ScanStore`] owns a single WAL-mode connection behind a
//! mutex. Scan history is append-only; the only row that is ever updated in
//! place is `domains.last_scanned`, and that update happens inside the same
//! transaction as the batch insert it belongs to.

pub mod error;
pub mod scan_store;


pub use error::{Result, StorageError};
pub use scan_store::{ScanResultRow, ScanStore};
