//! Item Storage Engine
//!
//! This module provides the durable core of the store:
//!
//! - **types**: Core data structures (ItemId, Item, TimeRange)
//! - **codec**: Versioned binary record layout
//! - **wal**: Write-ahead log for durability
//! - **checkpoint**: Checkpoint file format
//! - **snapshot**: Immutable committed state and the scan cursor
//! - **engine**: Main storage engine orchestrating all components
//! - **failpoint**: Fault injection for durability tests
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Mutations → Codec → WAL frame (fsync) → Snapshot swap
//!
//! Read Path:
//!   Snapshot → Time index → Scan
//!
//! Checkpoint:
//!   Snapshot → items.dat.tmp → rename → WAL truncate
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use itemstore::storage::{ItemStore, StoreConfig, ScanOrder, TimeRange, now_millis};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ItemStore::open(StoreConfig::new("./data")).await?;
//!
//!     let id = store.create(now_millis()).await?;
//!     assert!(store.get(id)?.is_some());
//!
//!     for item in store.scan_range(TimeRange::last_hours(24), ScanOrder::Descending) {
//!         println!("{} at {}", item.id(), item.timestamp());
//!     }
//!
//!     store.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod codec;
pub mod engine;
pub mod error;
pub mod failpoint;
pub mod snapshot;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use checkpoint::SkippedRecord;
pub use engine::{ItemStore, RecoveryReport, StoreConfig, StoreStats};
pub use error::{StorageError, StorageResult};
pub use failpoint::FailPoints;
pub use snapshot::{Scan, Snapshot};
pub use types::{now_millis, Item, ItemId, ScanOrder, TimeRange, WriteOutcome};
pub use wal::WalSyncMode;
