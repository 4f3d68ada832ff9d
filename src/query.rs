//! Read-only views over the store
//!
//! Every call takes one snapshot and reads only from it, so a query never
//! observes a half-applied batch and never blocks writers.

use crate::storage::{Item, ItemStore, Scan, ScanOrder, TimeRange};
use std::sync::Arc;

/// Query façade over a shared [`ItemStore`]
#[derive(Clone)]
pub struct ItemQuery {
    store: Arc<ItemStore>,
    order: ScanOrder,
}

impl ItemQuery {
    pub fn new(store: Arc<ItemStore>) -> Self {
        Self {
            store,
            order: ScanOrder::Ascending,
        }
    }

    /// Set the order used by [`all`](Self::all) and [`in_range`](Self::in_range)
    pub fn order(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }

    /// Every item
    pub fn all(&self) -> Scan {
        self.store.scan(self.order)
    }

    /// Items with `from <= timestamp <= to`; empty when `from > to`
    pub fn in_range(&self, from: i64, to: i64) -> Scan {
        self.store
            .scan_range(TimeRange { start: from, end: to }, self.order)
    }

    pub fn count(&self) -> usize {
        self.store.snapshot().len()
    }

    pub fn count_in_range(&self, from: i64, to: i64) -> usize {
        self.store
            .snapshot()
            .count_in_range(TimeRange { start: from, end: to })
    }

    /// The `n` newest items, newest first
    pub fn latest(&self, n: usize) -> Vec<Item> {
        self.store.scan(ScanOrder::Descending).take(n).collect()
    }

    /// Oldest and newest timestamps
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        self.store.snapshot().time_bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use tempfile::tempdir;

    async fn create_test_query(timestamps: &[i64]) -> (ItemQuery, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ItemStore::open(StoreConfig::new(dir.path())).await.unwrap();
        for &ts in timestamps {
            store.create(ts).await.unwrap();
        }
        (ItemQuery::new(Arc::new(store)), dir)
    }

    fn timestamps(scan: Scan) -> Vec<i64> {
        scan.map(|item| item.timestamp()).collect()
    }

    #[tokio::test]
    async fn test_in_range_inclusive() {
        // T0 < T1 < T2 < T3 < T4
        let (t0, t1, t2, t3, t4) = (1_000, 2_000, 3_000, 4_000, 5_000);
        let (query, _dir) = create_test_query(&[t4, t1, t2]).await;

        assert_eq!(timestamps(query.in_range(t0, t3)), vec![t1, t2]);
        assert_eq!(timestamps(query.in_range(t1, t2)), vec![t1, t2]);
        assert_eq!(query.count_in_range(t2, t4), 2);
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let (query, _dir) = create_test_query(&[10, 20, 30]).await;
        assert!(timestamps(query.in_range(30, 10)).is_empty());
        assert_eq!(query.count_in_range(30, 10), 0);
    }

    #[tokio::test]
    async fn test_all_and_count() {
        let (query, _dir) = create_test_query(&[30, 10, 20]).await;

        assert_eq!(timestamps(query.all()), vec![10, 20, 30]);
        assert_eq!(query.count(), 3);

        let descending = query.clone().order(ScanOrder::Descending);
        assert_eq!(timestamps(descending.all()), vec![30, 20, 10]);
        assert_eq!(timestamps(descending.in_range(15, 30)), vec![30, 20]);
    }

    #[tokio::test]
    async fn test_latest() {
        let (query, _dir) = create_test_query(&[5, 50, 500, 5_000]).await;

        let latest: Vec<i64> = query.latest(2).iter().map(|i| i.timestamp()).collect();
        assert_eq!(latest, vec![5_000, 500]);
        assert_eq!(query.latest(10).len(), 4);
        assert!(query.latest(0).is_empty());
        assert_eq!(query.time_bounds(), Some((5, 5_000)));
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (query, _dir) = create_test_query(&[]).await;
        assert_eq!(query.all().count(), 0);
        assert_eq!(query.count(), 0);
        assert!(query.time_bounds().is_none());
    }
}
