//! Fault injection for durability testing
//!
//! Named fail points sit at the critical steps of the commit and checkpoint
//! paths. An armed point makes that step fail with an I/O error instead of
//! aborting the process, so tests can assert on the surviving state.
//!
//! Points are armed per store instance (`ItemStore::fail_points()`), or at
//! open time through `ITEMSTORE_FAIL_POINT` (comma-separated names).
//!
//! ```ignore
//! store.fail_points().arm_once(points::WAL_TORN_APPEND);
//! assert!(store.create(now_millis()).await.is_err());
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Environment variable read by [`FailPoints::from_env`]
pub const FAIL_POINT_ENV: &str = "ITEMSTORE_FAIL_POINT";

/// All defined fail point names
pub mod points {
    /// Before any byte of a WAL frame is written
    pub const WAL_BEFORE_APPEND: &str = "wal_before_append";
    /// After half of a WAL frame reached the file (simulates a torn write)
    pub const WAL_TORN_APPEND: &str = "wal_torn_append";
    /// After the frame is written, before it is synced
    pub const WAL_BEFORE_FSYNC: &str = "wal_before_fsync";
    /// After the checkpoint temp file is written, before it replaces the old one
    pub const CHECKPOINT_BEFORE_RENAME: &str = "checkpoint_before_rename";
    /// After the new checkpoint is in place, before the WAL is truncated
    pub const CHECKPOINT_BEFORE_WAL_TRUNCATE: &str = "checkpoint_before_wal_truncate";

    pub fn all() -> &'static [&'static str] {
        &[
            WAL_BEFORE_APPEND,
            WAL_TORN_APPEND,
            WAL_BEFORE_FSYNC,
            CHECKPOINT_BEFORE_RENAME,
            CHECKPOINT_BEFORE_WAL_TRUNCATE,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Always,
    Once,
}

/// Set of armed fail points
#[derive(Debug, Default)]
pub struct FailPoints {
    /// Fast path: false when nothing is armed
    any_armed: AtomicBool,
    armed: Mutex<HashMap<String, Trigger>>,
}

impl FailPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the points listed in `ITEMSTORE_FAIL_POINT`
    pub fn from_env() -> Self {
        let fail_points = Self::new();
        if let Ok(value) = std::env::var(FAIL_POINT_ENV) {
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if !points::all().contains(&name) {
                    tracing::warn!("Unknown fail point in {}: {}", FAIL_POINT_ENV, name);
                }
                tracing::warn!("Fail point armed from environment: {}", name);
                fail_points.arm(name);
            }
        }
        fail_points
    }

    /// Fail every time `name` is reached until disarmed
    pub fn arm(&self, name: &str) {
        self.set(name, Trigger::Always);
    }

    /// Fail the next time `name` is reached, then disarm
    pub fn arm_once(&self, name: &str) {
        self.set(name, Trigger::Once);
    }

    pub fn disarm(&self, name: &str) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        armed.remove(name);
        self.any_armed.store(!armed.is_empty(), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        armed.clear();
        self.any_armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self, name: &str) -> bool {
        if !self.any_armed.load(Ordering::SeqCst) {
            return false;
        }
        let armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        armed.contains_key(name)
    }

    /// Return an injected error if `name` is armed
    pub fn check(&self, name: &str) -> io::Result<()> {
        if !self.any_armed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        match armed.get(name).copied() {
            None => Ok(()),
            Some(trigger) => {
                if trigger == Trigger::Once {
                    armed.remove(name);
                    self.any_armed.store(!armed.is_empty(), Ordering::SeqCst);
                }
                tracing::debug!("Fail point triggered: {}", name);
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected fault at {}", name),
                ))
            }
        }
    }

    fn set(&self, name: &str, trigger: Trigger) {
        let mut armed = self.armed.lock().unwrap_or_else(PoisonError::into_inner);
        armed.insert(name.to_string(), trigger);
        self.any_armed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_points_pass() {
        let fp = FailPoints::new();
        for name in points::all() {
            assert!(fp.check(name).is_ok());
        }
    }

    #[test]
    fn test_arm_always_keeps_failing() {
        let fp = FailPoints::new();
        fp.arm(points::WAL_BEFORE_FSYNC);

        assert!(fp.check(points::WAL_BEFORE_FSYNC).is_err());
        assert!(fp.check(points::WAL_BEFORE_FSYNC).is_err());
        assert!(fp.check(points::WAL_BEFORE_APPEND).is_ok());

        fp.disarm(points::WAL_BEFORE_FSYNC);
        assert!(fp.check(points::WAL_BEFORE_FSYNC).is_ok());
    }

    #[test]
    fn test_arm_once_fires_once() {
        let fp = FailPoints::new();
        fp.arm_once(points::WAL_TORN_APPEND);

        assert!(fp.is_armed(points::WAL_TORN_APPEND));
        let err = fp.check(points::WAL_TORN_APPEND).unwrap_err();
        assert!(err.to_string().contains(points::WAL_TORN_APPEND));
        assert!(!fp.is_armed(points::WAL_TORN_APPEND));
        assert!(fp.check(points::WAL_TORN_APPEND).is_ok());
    }

    #[test]
    fn test_clear() {
        let fp = FailPoints::new();
        fp.arm(points::WAL_BEFORE_APPEND);
        fp.arm(points::CHECKPOINT_BEFORE_RENAME);
        fp.clear();
        assert!(!fp.is_armed(points::WAL_BEFORE_APPEND));
        assert!(fp.check(points::CHECKPOINT_BEFORE_RENAME).is_ok());
    }
}
