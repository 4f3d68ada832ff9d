//! Immutable store snapshots and the ordered scan cursor
//!
//! A `Snapshot` is the committed state at one sequence number. The store
//! swaps in a new `Arc<Snapshot>` per commit and never mutates a published
//! one, so readers holding an `Arc` see a stable view for as long as they
//! keep it.

use crate::storage::types::{Item, ItemId, ScanOrder, TimeRange};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

/// Committed state of the store
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// id -> timestamp
    items: BTreeMap<ItemId, i64>,
    /// Time index: (timestamp, id) in scan order
    by_time: BTreeSet<(i64, ItemId)>,
    /// Ids whose persisted record could not be decoded
    quarantined: BTreeSet<ItemId>,
    /// Sequence number of the last commit folded in
    seq: u64,
}

impl Snapshot {
    pub fn get(&self, id: ItemId) -> Option<Item> {
        self.items.get(&id).map(|&ts| Item::new(id, ts))
    }

    /// Whether a readable item with this id exists
    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id)
    }

    /// Whether the id is known at all, readable or quarantined
    pub fn exists(&self, id: ItemId) -> bool {
        self.contains(id) || self.is_quarantined(id)
    }

    pub fn is_quarantined(&self, id: ItemId) -> bool {
        self.quarantined.contains(&id)
    }

    /// Number of readable items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantined.len()
    }

    pub fn quarantined(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.quarantined.iter().copied()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Oldest and newest timestamps, if any item exists
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let first = self.by_time.first()?;
        let last = self.by_time.last()?;
        Some((first.0, last.0))
    }

    /// Items in id order
    pub fn iter(&self) -> impl Iterator<Item = Item> + '_ {
        self.items.iter().map(|(&id, &ts)| Item::new(id, ts))
    }

    /// Number of items whose timestamp lies in `range`
    pub fn count_in_range(&self, range: TimeRange) -> usize {
        if range.start > range.end {
            return 0;
        }
        self.by_time
            .range((range.start, ItemId::MIN)..=(range.end, ItemId::MAX))
            .count()
    }

    /// Lazy ordered scan over this snapshot
    pub fn scan(self: &Arc<Self>, order: ScanOrder, range: TimeRange) -> Scan {
        Scan::new(Arc::clone(self), order, range)
    }

    pub(crate) fn insert(&mut self, item: Item) {
        if let Some(old) = self.items.insert(item.id(), item.timestamp()) {
            self.by_time.remove(&(old, item.id()));
        }
        self.by_time.insert(item.order_key());
        self.quarantined.remove(&item.id());
    }

    /// Remove an item or a quarantined id; false if neither was present
    pub(crate) fn remove(&mut self, id: ItemId) -> bool {
        let was_quarantined = self.quarantined.remove(&id);
        match self.items.remove(&id) {
            Some(ts) => {
                self.by_time.remove(&(ts, id));
                true
            }
            None => was_quarantined,
        }
    }

    pub(crate) fn set_timestamp(&mut self, id: ItemId, timestamp: i64) -> bool {
        match self.items.get_mut(&id) {
            Some(ts) => {
                self.by_time.remove(&(*ts, id));
                *ts = timestamp;
                self.by_time.insert((timestamp, id));
                true
            }
            None => false,
        }
    }

    pub(crate) fn quarantine(&mut self, id: ItemId) {
        if let Some(ts) = self.items.remove(&id) {
            self.by_time.remove(&(ts, id));
        }
        self.quarantined.insert(id);
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }
}

/// Lazy, restartable cursor over a snapshot in timestamp order.
///
/// Items are produced one at a time from the time index; nothing is
/// materialized up front. Equal timestamps come out in id order (reversed
/// for descending scans). The cursor holds its snapshot alive, so commits
/// made while it is open are never observed.
#[derive(Debug, Clone)]
pub struct Scan {
    snapshot: Arc<Snapshot>,
    order: ScanOrder,
    range: TimeRange,
    /// Last key yielded
    cursor: Option<(i64, ItemId)>,
    done: bool,
}

impl Scan {
    fn new(snapshot: Arc<Snapshot>, order: ScanOrder, range: TimeRange) -> Self {
        Self {
            snapshot,
            order,
            range,
            cursor: None,
            done: range.start > range.end,
        }
    }

    /// Start over from the first item
    pub fn rewind(&mut self) {
        self.cursor = None;
        self.done = self.range.start > self.range.end;
    }

    pub fn order(&self) -> ScanOrder {
        self.order
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Sequence number of the snapshot being scanned
    pub fn seq(&self) -> u64 {
        self.snapshot.seq()
    }

    fn next_key(&self) -> Option<(i64, ItemId)> {
        let low = (self.range.start, ItemId::MIN);
        let high = (self.range.end, ItemId::MAX);

        match self.order {
            ScanOrder::Ascending => {
                let lower = match self.cursor {
                    Some(key) => Bound::Excluded(key),
                    None => Bound::Included(low),
                };
                self.snapshot
                    .by_time
                    .range((lower, Bound::Included(high)))
                    .next()
                    .copied()
            }
            ScanOrder::Descending => {
                let upper = match self.cursor {
                    Some(key) => Bound::Excluded(key),
                    None => Bound::Included(high),
                };
                self.snapshot
                    .by_time
                    .range((Bound::Included(low), upper))
                    .next_back()
                    .copied()
            }
        }
    }
}

impl Iterator for Scan {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        if self.done {
            return None;
        }

        match self.next_key() {
            Some(key) => {
                self.cursor = Some(key);
                Some(Item::new(key.1, key.0))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl std::iter::FusedIterator for Scan {}
