/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use certwatch_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "domain",
///     id: 99,
/// };
/// assert!(err.to_string().contains("domain"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found in the database.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: i64 },

    /// A hostname failed normalization (empty after trimming).
    #[error("Storage: invalid hostname: {0:?}")]
    InvalidHostname(String),

    /// An insert operation did not return the newly created row, which should
    /// be unreachable under normal conditions.
    #[error("Storage: insert of {entity} succeeded but the row could not be read back")]
    InsertReadback { entity: &'static str },

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure (the `san_list` column).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A column contained a value outside the expected domain.
    #[error("Storage: unexpected value in column '{column}': {value}")]
    UnexpectedColumnValue { column: &'static str, value: String },

    /// An I/O error while preparing the data directory.
    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
