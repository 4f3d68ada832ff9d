//! Change tracking between commits
//!
//! A `ChangeTracker` stages inserts, deletes and timestamp updates against a
//! shared [`ItemStore`] and commits them as one atomic batch. Successive
//! operations on the same id are coalesced, so the batch carries at most one
//! mutation per item.
//!
//! ```text
//! insert → update   ⇒ Inserted(new_ts)
//! insert → delete   ⇒ (nothing)
//! update → update   ⇒ TimestampUpdated(last_ts)
//! update → delete   ⇒ Deleted
//! delete → anything ⇒ NotFound
//! ```

use crate::storage::engine::Mutation;
use crate::storage::{Item, ItemId, ItemStore, StorageError, StorageResult, WriteOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A staged change to one item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    /// New item with this timestamp
    Inserted(i64),
    /// Existing item removed
    Deleted,
    /// Existing item moved to this timestamp
    TimestampUpdated(i64),
}

/// Buffers changes until [`commit`](ChangeTracker::commit) or
/// [`rollback`](ChangeTracker::rollback).
pub struct ChangeTracker {
    store: Arc<ItemStore>,
    pending: BTreeMap<ItemId, PendingOp>,
}

impl ChangeTracker {
    pub fn new(store: Arc<ItemStore>) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    /// Stage a new item; its id is reserved right away
    ///
    /// A reserved id is never handed out again, even if the insert is
    /// rolled back.
    pub fn insert(&mut self, timestamp: i64) -> StorageResult<ItemId> {
        let id = self.store.allocate_id()?;
        self.pending.insert(id, PendingOp::Inserted(timestamp));
        Ok(id)
    }

    /// Stage removal of an item
    pub fn delete(&mut self, id: ItemId) -> WriteOutcome {
        match self.pending.get(&id).copied() {
            Some(PendingOp::Inserted(_)) => {
                self.pending.remove(&id);
                WriteOutcome::Applied
            }
            Some(PendingOp::Deleted) => WriteOutcome::NotFound,
            Some(PendingOp::TimestampUpdated(_)) => {
                self.pending.insert(id, PendingOp::Deleted);
                WriteOutcome::Applied
            }
            None => {
                if self.store.snapshot().exists(id) {
                    self.pending.insert(id, PendingOp::Deleted);
                    WriteOutcome::Applied
                } else {
                    WriteOutcome::NotFound
                }
            }
        }
    }

    /// Stage a timestamp change
    ///
    /// Fails with `CorruptRecord` if the committed record is quarantined.
    pub fn update_timestamp(&mut self, id: ItemId, timestamp: i64) -> StorageResult<WriteOutcome> {
        let op = match self.pending.get(&id).copied() {
            Some(PendingOp::Inserted(_)) => PendingOp::Inserted(timestamp),
            Some(PendingOp::TimestampUpdated(_)) => PendingOp::TimestampUpdated(timestamp),
            Some(PendingOp::Deleted) => return Ok(WriteOutcome::NotFound),
            None => {
                let snapshot = self.store.snapshot();
                if snapshot.is_quarantined(id) {
                    return Err(StorageError::CorruptRecord {
                        id: Some(id),
                        reason: "record is quarantined".to_string(),
                    });
                }
                if !snapshot.contains(id) {
                    return Ok(WriteOutcome::NotFound);
                }
                PendingOp::TimestampUpdated(timestamp)
            }
        };

        self.pending.insert(id, op);
        Ok(WriteOutcome::Applied)
    }

    /// Apply every staged change atomically; returns how many were applied
    ///
    /// Deletions go first, then inserts, then updates. On failure nothing
    /// becomes visible and the staged changes are kept for a retry.
    pub async fn commit(&mut self) -> StorageResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for (&id, &op) in &self.pending {
            match op {
                PendingOp::Deleted => deletes.push(Mutation::Delete(id)),
                PendingOp::Inserted(ts) => inserts.push(Mutation::Insert(Item::new(id, ts))),
                PendingOp::TimestampUpdated(ts) => {
                    updates.push(Mutation::Update { id, timestamp: ts })
                }
            }
        }

        let mut batch = deletes;
        batch.append(&mut inserts);
        batch.append(&mut updates);
        let count = batch.len();

        match self.store.apply(batch).await {
            Ok(seq) => {
                tracing::debug!("Tracker committed {} changes at seq {}", count, seq);
                self.pending.clear();
                Ok(count)
            }
            Err(e) => {
                tracing::warn!("Tracker commit of {} changes failed: {}", count, e);
                Err(e)
            }
        }
    }

    /// Discard every staged change
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Rolling back {} staged changes", self.pending.len());
        }
        self.pending.clear();
    }

    /// Staged changes in id order
    pub fn pending(&self) -> impl Iterator<Item = (ItemId, PendingOp)> + '_ {
        self.pending.iter().map(|(&id, &op)| (id, op))
    }

    pub fn pending_op(&self, id: ItemId) -> Option<PendingOp> {
        self.pending.get(&id).copied()
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.store
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        if self.is_dirty() {
            tracing::warn!(
                "ChangeTracker dropped with {} uncommitted changes",
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::failpoint::points;
    use crate::storage::{ScanOrder, StoreConfig};
    use tempfile::tempdir;

    async fn create_test_tracker() -> (ChangeTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ItemStore::open(StoreConfig::new(dir.path())).await.unwrap();
        (ChangeTracker::new(Arc::new(store)), dir)
    }

    fn committed(tracker: &ChangeTracker) -> Vec<(u64, i64)> {
        tracker
            .store()
            .scan(ScanOrder::Ascending)
            .map(|item| (item.id().get(), item.timestamp()))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_is_invisible_until_commit() {
        let (mut tracker, _dir) = create_test_tracker().await;

        let id = tracker.insert(100).unwrap();
        assert!(tracker.is_dirty());
        assert!(tracker.store().get(id).unwrap().is_none());

        assert_eq!(tracker.commit().await.unwrap(), 1);
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.store().get(id).unwrap().unwrap().timestamp(), 100);
    }

    #[tokio::test]
    async fn test_coalescing_rules() {
        let (mut tracker, _dir) = create_test_tracker().await;
        let existing = tracker.store().create(10).await.unwrap();
        let other = tracker.store().create(20).await.unwrap();

        // insert then update
        let a = tracker.insert(1).unwrap();
        assert!(tracker.update_timestamp(a, 2).unwrap().is_applied());
        assert_eq!(tracker.pending_op(a), Some(PendingOp::Inserted(2)));

        // insert then delete
        let b = tracker.insert(3).unwrap();
        assert!(tracker.delete(b).is_applied());
        assert_eq!(tracker.pending_op(b), None);

        // update then update
        tracker.update_timestamp(existing, 11).unwrap();
        tracker.update_timestamp(existing, 12).unwrap();
        assert_eq!(tracker.pending_op(existing), Some(PendingOp::TimestampUpdated(12)));

        // update then delete, then anything
        tracker.update_timestamp(other, 21).unwrap();
        assert!(tracker.delete(other).is_applied());
        assert_eq!(tracker.pending_op(other), Some(PendingOp::Deleted));
        assert_eq!(tracker.delete(other), WriteOutcome::NotFound);
        assert_eq!(
            tracker.update_timestamp(other, 22).unwrap(),
            WriteOutcome::NotFound
        );

        assert_eq!(tracker.len(), 3);
        tracker.commit().await.unwrap();
        assert_eq!(committed(&tracker), vec![(a.get(), 2), (existing.get(), 12)]);
    }

    #[tokio::test]
    async fn test_missing_target_stages_nothing() {
        let (mut tracker, _dir) = create_test_tracker().await;
        let missing = ItemId::new(404);

        assert_eq!(tracker.delete(missing), WriteOutcome::NotFound);
        assert_eq!(
            tracker.update_timestamp(missing, 1).unwrap(),
            WriteOutcome::NotFound
        );
        assert!(!tracker.is_dirty());
        assert_eq!(tracker.commit().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_applies_mixed_batch() {
        let (mut tracker, _dir) = create_test_tracker().await;
        let first = tracker.store().create(100).await.unwrap();
        let second = tracker.store().create(200).await.unwrap();

        tracker.delete(first);
        let third = tracker.insert(300).unwrap();
        tracker.update_timestamp(second, 250).unwrap();

        let pending: Vec<(ItemId, PendingOp)> = tracker.pending().collect();
        assert_eq!(
            pending,
            vec![
                (first, PendingOp::Deleted),
                (second, PendingOp::TimestampUpdated(250)),
                (third, PendingOp::Inserted(300)),
            ]
        );

        assert_eq!(tracker.commit().await.unwrap(), 3);
        assert_eq!(
            committed(&tracker),
            vec![(second.get(), 250), (third.get(), 300)]
        );
        assert_eq!(tracker.store().stats().await.wal_frames, 3);
    }

    #[tokio::test]
    async fn test_rollback_discards_and_burns_ids() {
        let (mut tracker, _dir) = create_test_tracker().await;
        let kept = tracker.store().create(1).await.unwrap();

        let staged = tracker.insert(2).unwrap();
        tracker.delete(kept);
        tracker.rollback();

        assert!(!tracker.is_dirty());
        assert_eq!(committed(&tracker), vec![(kept.get(), 1)]);

        let next = tracker.insert(3).unwrap();
        assert!(next > staged);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_pending_for_retry() {
        for n in 1..=5usize {
            for point in [
                points::WAL_BEFORE_APPEND,
                points::WAL_TORN_APPEND,
                points::WAL_BEFORE_FSYNC,
            ] {
                let (mut tracker, _dir) = create_test_tracker().await;
                let base = tracker.store().create(0).await.unwrap();

                for i in 0..n {
                    tracker.insert(i as i64 + 1).unwrap();
                }
                if n > 2 {
                    tracker.update_timestamp(base, 99).unwrap();
                }
                let staged: Vec<(ItemId, PendingOp)> = tracker.pending().collect();

                tracker.store().fail_points().arm_once(point);
                let result = tracker.commit().await;
                assert!(
                    matches!(result, Err(StorageError::CommitFailure(_))),
                    "{} changes at {}",
                    n,
                    point
                );
                assert_eq!(committed(&tracker), vec![(base.get(), 0)]);
                assert_eq!(tracker.pending().collect::<Vec<_>>(), staged);

                // Retry succeeds with the same staged set
                assert_eq!(tracker.commit().await.unwrap(), staged.len());
                assert_eq!(tracker.store().snapshot().len(), n + 1);
            }
        }
    }

    #[tokio::test]
    async fn test_conflict_when_target_disappears() {
        let (mut tracker, _dir) = create_test_tracker().await;
        let id = tracker.store().create(5).await.unwrap();

        tracker.update_timestamp(id, 6).unwrap();
        let inserted = tracker.insert(7).unwrap();

        // Another writer removes the item first
        tracker.store().delete(id).await.unwrap();

        assert!(matches!(
            tracker.commit().await,
            Err(StorageError::Conflict(conflicted)) if conflicted == id
        ));
        assert!(tracker.store().get(inserted).unwrap().is_none());
        assert_eq!(tracker.len(), 2);

        tracker.rollback();
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_commit_survives_restart() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());

        let ids = {
            let store = Arc::new(ItemStore::open(config.clone()).await.unwrap());
            let mut tracker = ChangeTracker::new(Arc::clone(&store));
            let ids = vec![
                tracker.insert(30).unwrap(),
                tracker.insert(10).unwrap(),
                tracker.insert(20).unwrap(),
            ];
            tracker.commit().await.unwrap();
            ids
        };

        let store = ItemStore::open(config).await.unwrap();
        for id in ids {
            assert!(store.get(id).unwrap().is_some());
        }
        let order: Vec<i64> = store.scan(ScanOrder::Ascending).map(|i| i.timestamp()).collect();
        assert_eq!(order, vec![10, 20, 30]);
    }
}
