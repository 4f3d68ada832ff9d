//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer. A missing item is
//! not among them: lookups return `Option` and targeted writes return
//! [`WriteOutcome`](crate::storage::WriteOutcome).

use crate::storage::types::ItemId;
use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed outside the record codec
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A record's bytes do not match the layout of its declared schema version
    #[error("Corrupt record {}: {reason}", describe_id(.id))]
    CorruptRecord { id: Option<ItemId>, reason: String },

    /// Persisted data was written with a schema version this build cannot read
    #[error("Schema mismatch: found version {found}, supported version {supported}")]
    SchemaMismatch { found: u16, supported: u16 },

    /// A batch could not be made durable; nothing from it is visible
    #[error("Commit failed: {0}")]
    CommitFailure(String),

    /// A staged delete or update targets an item that no longer exists
    #[error("Conflict: item {0} no longer exists")]
    Conflict(ItemId),

    /// WAL or checkpoint framing is damaged (checksum mismatch, bad magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Every id below `u64::MAX` has been handed out
    #[error("Item id space exhausted")]
    IdsExhausted,

    /// The store has been shut down
    #[error("Store is closed")]
    Closed,
}

fn describe_id(id: &Option<ItemId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "<unknown id>".to_string(),
    }
}

impl StorageError {
    /// Attach an item id to a record-level error that was raised without one
    pub(crate) fn with_id(self, item: ItemId) -> Self {
        match self {
            StorageError::CorruptRecord { id: None, reason } => StorageError::CorruptRecord {
                id: Some(item),
                reason,
            },
            other => other,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::CommitFailure(_) | StorageError::Io(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::Conflict(ItemId::new(9));
        assert_eq!(err.to_string(), "Conflict: item 9 no longer exists");

        let err = StorageError::SchemaMismatch {
            found: 3,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "Schema mismatch: found version 3, supported version 1"
        );
    }

    #[test]
    fn test_corrupt_record_display_and_id() {
        let err = StorageError::CorruptRecord {
            id: None,
            reason: "truncated".into(),
        };
        assert_eq!(err.to_string(), "Corrupt record <unknown id>: truncated");

        let err = err.with_id(ItemId::new(12));
        assert_eq!(err.to_string(), "Corrupt record 12: truncated");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = io_err.into();
        assert!(matches!(storage_err, StorageError::Io(_)));
        assert!(storage_err.is_retryable());
    }
}
