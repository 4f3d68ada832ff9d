//! # itemstore
//!
//! Embedded, schema-typed persistence for timestamped items.
//!
//! ## Features
//!
//! - **Durability**: Every commit is one CRC-framed WAL record, fsynced before it is visible
//! - **Atomic batches**: A batch is applied completely or not at all, even across crashes
//! - **Snapshot reads**: Scans and queries never block writers and never see partial commits
//! - **Versioned records**: Self-describing binary layout with explicit schema checks
//!
//! ## Modules
//!
//! - [`storage`]: Storage engine, WAL, checkpoints and record codec
//! - [`tracker`]: Staged changes committed as one batch
//! - [`query`]: Read-only views over a snapshot
//! - [`config`]: File and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use itemstore::storage::{ItemStore, StoreConfig, now_millis};
//! use itemstore::{ChangeTracker, ItemQuery};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(ItemStore::open(StoreConfig::new("./data")).await?);
//!
//!     // Stage a few changes and commit them together
//!     let mut tracker = ChangeTracker::new(Arc::clone(&store));
//!     let first = tracker.insert(now_millis())?;
//!     tracker.insert(now_millis() + 1_000)?;
//!     tracker.commit().await?;
//!
//!     // Read them back
//!     let query = ItemQuery::new(Arc::clone(&store));
//!     for item in query.all() {
//!         println!("{} @ {}", item.id(), item.timestamp());
//!     }
//!
//!     store.delete(first).await?;
//!     store.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod query;
pub mod storage;
pub mod tracker;

pub use query::ItemQuery;
pub use tracker::{ChangeTracker, PendingOp};
