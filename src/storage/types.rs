//! Core data types for the item store
//!
//! - `ItemId`: opaque, never-reused identifier
//! - `Item`: the single persisted entity (an id and a timestamp)
//! - `TimeRange`: inclusive timestamp interval for range scans
//! - `ScanOrder` and `WriteOutcome`: small result/option enums

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier of an item.
///
/// Ids are allocated by the store from a persisted counter and are never
/// handed out twice, even after the item they named is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    /// Smallest possible id (used as a range sentinel)
    pub const MIN: ItemId = ItemId(0);
    /// Largest possible id (used as a range sentinel)
    pub const MAX: ItemId = ItemId(u64::MAX);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ItemId)
    }
}

/// A persisted item.
///
/// The store owns the canonical copy; values handed to callers are clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    id: ItemId,
    /// Unix timestamp in milliseconds (UTC)
    timestamp: i64,
}

impl Item {
    pub fn new(id: ItemId, timestamp: i64) -> Self {
        Self { id, timestamp }
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Sort key used by every ordered view: timestamp, then insertion id
    pub(crate) fn order_key(&self) -> (i64, ItemId) {
        (self.timestamp, self.id)
    }
}

/// Current time in Unix milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Direction of an ordered scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrder {
    /// Oldest first; equal timestamps in id order
    #[default]
    Ascending,
    /// Newest first; equal timestamps in reverse id order
    Descending,
}

/// Result of a write that targets an existing item.
///
/// Absence of the target is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The item existed and the write took effect
    Applied,
    /// No item with that id exists
    NotFound,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied)
    }
}

/// Time range for queries (closed interval: [start, end])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Range covering every representable timestamp
    pub const ALL: TimeRange = TimeRange {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start > end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "TimeRange: start must not be after end");
        Self { start, end }
    }

    /// Create a time range, returning None if start > end
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Range for the last N hours up to now
    pub fn last_hours(hours: i64) -> Self {
        let end = now_millis();
        let start = end.saturating_sub(hours.saturating_mul(3600 * 1000));
        Self { start, end }
    }

    /// Range for the last N days up to now
    pub fn last_days(days: i64) -> Self {
        Self::last_hours(days.saturating_mul(24))
    }

    /// Range covering one calendar day (UTC)
    pub fn day(year: i32, month: u32, day: u32) -> Option<Self> {
        use chrono::NaiveDate;
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?);
        let end = start.checked_add_signed(chrono::Duration::try_days(1)?)?;
        Some(Self {
            start: start.timestamp_millis(),
            end: end.timestamp_millis() - 1,
        })
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_inclusive_bounds() {
        let range = TimeRange::new(1000, 2000);

        assert!(!range.contains(999));
        assert!(range.contains(1000));
        assert!(range.contains(1500));
        assert!(range.contains(2000));
        assert!(!range.contains(2001));
    }

    #[test]
    fn test_time_range_single_point() {
        let range = TimeRange::new(5, 5);
        assert!(range.contains(5));
        assert!(!range.contains(4));
        assert!(!range.contains(6));
    }

    #[test]
    fn test_time_range_try_new_rejects_inverted() {
        assert!(TimeRange::try_new(10, 5).is_none());
        assert_eq!(TimeRange::try_new(5, 10), Some(TimeRange { start: 5, end: 10 }));
    }

    #[test]
    fn test_day_range() {
        let range = TimeRange::day(2025, 3, 16).unwrap();
        assert_eq!(range.end - range.start, 24 * 3600 * 1000 - 1);
        assert!(TimeRange::day(2025, 2, 30).is_none());
    }

    #[test]
    fn test_item_accessors() {
        let item = Item::new(ItemId::new(7), 1_700_000_000_000);
        assert_eq!(item.id().get(), 7);
        assert_eq!(item.timestamp(), 1_700_000_000_000);
    }

    #[test]
    fn test_item_id_parse_and_display() {
        let id: ItemId = " 42 ".parse().unwrap();
        assert_eq!(id, ItemId::new(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<ItemId>().is_err());
    }

    #[test]
    fn test_item_json_shape() {
        let item = Item::new(ItemId::new(3), 1000);
        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"id":3,"timestamp":1000}"#);
    }
}
