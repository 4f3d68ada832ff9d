//! Item Storage Engine
//!
//! The engine orchestrates all components:
//! - Write path: Mutation batch → Codec → WAL frame (fsync) → Snapshot swap
//! - Read path: Snapshot → Scan cursor
//! - Checkpoint: Snapshot → items.dat (temp + rename) → WAL truncate
//!
//! Readers never wait on writers: they clone the current `Arc<Snapshot>`
//! under a brief lock. Writers serialize on an async mutex guarding the WAL.

use crate::storage::checkpoint::{self, SkippedRecord};
use crate::storage::codec;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::failpoint::{points, FailPoints};
use crate::storage::snapshot::{Scan, Snapshot};
use crate::storage::types::{Item, ItemId, ScanOrder, TimeRange, WriteOutcome};
use crate::storage::wal::{WalFrame, WalMutation, WalSyncMode, WriteAheadLog};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all data
    pub data_dir: PathBuf,
    /// WAL sync strategy
    pub wal_sync: WalSyncMode,
    /// WAL size that triggers a background checkpoint (default: 4MB)
    pub checkpoint_wal_bytes: u64,
    /// How often the background task checks the WAL size (default: 5000ms)
    pub checkpoint_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("itemstore_data"),
            wal_sync: WalSyncMode::EveryWrite,
            checkpoint_wal_bytes: 4 * 1024 * 1024, // 4MB
            checkpoint_interval_ms: 5000,          // 5 seconds
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Get path to WAL file
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal").join("items.wal")
    }

    /// Get path to checkpoint file
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("items.dat")
    }

    /// Where a checkpoint holding corrupt records is preserved
    pub fn quarantine_path(&self) -> PathBuf {
        self.data_dir.join("items.dat.quarantine")
    }

    /// Where a WAL holding undecodable inserts is preserved
    pub fn wal_quarantine_path(&self) -> PathBuf {
        self.data_dir.join("wal").join("items.wal.quarantine")
    }
}

/// A single change inside a committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mutation {
    Insert(Item),
    Delete(ItemId),
    Update { id: ItemId, timestamp: i64 },
}

/// What `open` found on disk
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// A checkpoint file was present and loaded
    pub checkpoint_loaded: bool,
    /// Records read from the checkpoint
    pub checkpoint_records: u64,
    /// WAL frames applied on top of the checkpoint
    pub frames_replayed: usize,
    /// WAL frames already covered by the checkpoint
    pub frames_skipped: usize,
    /// Bytes of torn or corrupt WAL tail that were cut off
    pub discarded_wal_bytes: u64,
    /// Records that could not be decoded, by id
    pub quarantined: Vec<SkippedRecord>,
}

impl RecoveryReport {
    /// True when nothing was discarded or quarantined
    pub fn is_clean(&self) -> bool {
        self.discarded_wal_bytes == 0 && self.quarantined.is_empty()
    }
}

/// Writer-side state, guarded by the commit mutex
struct WriterState {
    wal: WriteAheadLog,
    /// Sequence number for the next commit
    next_seq: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
    closed: bool,
}

impl WriterState {
    fn ensure_writable(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if self.poisoned {
            return Err(StorageError::CommitFailure(
                "store is read-only after an unrecoverable WAL failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// The embedded item store
pub struct ItemStore {
    /// Configuration
    config: StoreConfig,
    /// Last committed image
    snapshot: RwLock<Arc<Snapshot>>,
    /// WAL and commit bookkeeping; holding it serializes writers
    writer: Mutex<WriterState>,
    /// Next id to hand out; never moves backwards
    next_id: AtomicU64,
    /// Fault injection for this instance
    faults: FailPoints,
    /// What recovery found at open
    recovery: RecoveryReport,
    /// Shutdown signal for the background task
    shutdown: AtomicBool,
}

impl ItemStore {
    /// Open the store at `config.data_dir`, recovering whatever is on disk
    pub async fn open(config: StoreConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let tmp_path = config.checkpoint_path().with_extension("dat.tmp");
        if tmp_path.exists() {
            tracing::debug!("Removing stale checkpoint temp file {:?}", tmp_path);
            std::fs::remove_file(&tmp_path)?;
        }

        let mut report = RecoveryReport::default();
        let mut snapshot = Snapshot::default();
        let mut next_id = 1u64;
        let mut last_seq = 0u64;

        // Load checkpoint
        if let Some(loaded) = checkpoint::load(&config.checkpoint_path())? {
            report.checkpoint_loaded = true;
            report.checkpoint_records = loaded.header.record_count;
            next_id = next_id.max(loaded.header.next_id);
            last_seq = loaded.header.last_seq;

            for item in loaded.items {
                next_id = next_id.max(item.id().get().saturating_add(1));
                snapshot.insert(item);
            }

            if !loaded.skipped.is_empty() {
                for skipped in &loaded.skipped {
                    if skipped.id_verified {
                        tracing::warn!(
                            "Quarantined checkpoint record {}: {}",
                            skipped.id,
                            skipped.reason
                        );
                        next_id = next_id.max(skipped.id.get().saturating_add(1));
                        snapshot.quarantine(skipped.id);
                    } else if skipped.id.get() < loaded.header.next_id
                        && !snapshot.contains(skipped.id)
                    {
                        // Damaged id bytes never move the allocator
                        tracing::warn!(
                            "Quarantined checkpoint record {} (unverified id): {}",
                            skipped.id,
                            skipped.reason
                        );
                        snapshot.quarantine(skipped.id);
                    } else {
                        tracing::warn!(
                            "Dropped checkpoint record with unusable id {}: {}",
                            skipped.id,
                            skipped.reason
                        );
                    }
                }
                preserve_copy(&config.checkpoint_path(), &config.quarantine_path(), last_seq)?;
                report.quarantined.extend(loaded.skipped);
            }

            tracing::info!(
                "Loaded checkpoint: {} records, last_seq {}",
                report.checkpoint_records,
                last_seq
            );
        }
        snapshot.set_seq(last_seq);

        // Open WAL and replay it on top
        let (wal, replay) = WriteAheadLog::open(config.wal_path(), config.wal_sync)?;
        report.discarded_wal_bytes = replay.discarded_bytes;

        let mut wal_quarantined = false;
        for frame in replay.frames {
            if frame.seq <= last_seq {
                report.frames_skipped += 1;
                continue;
            }
            next_id = next_id.max(frame.next_id);

            for mutation in frame.mutations {
                match mutation {
                    WalMutation::Insert { id, record } => match codec::decode(&record) {
                        Ok(item) if item.id() == id => snapshot.insert(item),
                        Ok(item) => {
                            wal_quarantined = true;
                            Self::quarantine_replayed(
                                &mut snapshot,
                                &mut report,
                                id,
                                format!("frame id {} does not match record id {}", id, item.id()),
                            );
                        }
                        Err(e) => {
                            wal_quarantined = true;
                            let reason = e.with_id(id).to_string();
                            Self::quarantine_replayed(&mut snapshot, &mut report, id, reason);
                        }
                    },
                    WalMutation::Delete { id } => {
                        snapshot.remove(id);
                    }
                    WalMutation::Update { id, timestamp } => {
                        snapshot.set_timestamp(id, timestamp);
                    }
                }
            }

            snapshot.set_seq(frame.seq);
            report.frames_replayed += 1;
        }

        if wal_quarantined {
            preserve_copy(&config.wal_path(), &config.wal_quarantine_path(), snapshot.seq())?;
        }

        if report.frames_replayed > 0 || report.frames_skipped > 0 {
            tracing::info!(
                "Recovered {} WAL frames ({} already checkpointed)",
                report.frames_replayed,
                report.frames_skipped
            );
        }

        let next_seq = snapshot.seq() + 1;
        let store = Self {
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(WriterState {
                wal,
                next_seq,
                poisoned: false,
                closed: false,
            }),
            next_id: AtomicU64::new(next_id),
            faults: FailPoints::from_env(),
            recovery: report,
            shutdown: AtomicBool::new(false),
        };

        // Fold replayed frames into a fresh checkpoint
        if store.recovery.frames_replayed > 0 {
            store.checkpoint().await?;
        }

        tracing::info!(
            "Opened item store at {:?}: {} items, next id {}",
            store.config.data_dir,
            store.snapshot().len(),
            next_id
        );

        Ok(store)
    }

    fn quarantine_replayed(
        snapshot: &mut Snapshot,
        report: &mut RecoveryReport,
        id: ItemId,
        reason: String,
    ) {
        tracing::warn!("Quarantined WAL record {}: {}", id, reason);
        snapshot.quarantine(id);
        report.quarantined.push(SkippedRecord::new(id, reason));
    }

    /// Reserve a fresh id without persisting anything
    ///
    /// Ids stop at `u64::MAX - 1`; the allocator never wraps.
    pub(crate) fn allocate_id(&self) -> StorageResult<ItemId> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next < u64::MAX).then(|| next + 1)
            })
            .map(ItemId::new)
            .map_err(|_| StorageError::IdsExhausted)
    }

    /// Create an item and return its id once it is durable
    pub async fn create(&self, timestamp: i64) -> StorageResult<ItemId> {
        let id = self.allocate_id()?;
        self.apply(vec![Mutation::Insert(Item::new(id, timestamp))])
            .await?;
        Ok(id)
    }

    /// Look up an item by id
    pub fn get(&self, id: ItemId) -> StorageResult<Option<Item>> {
        let snapshot = self.snapshot();
        if snapshot.is_quarantined(id) {
            return Err(StorageError::CorruptRecord {
                id: Some(id),
                reason: "record is quarantined".to_string(),
            });
        }
        Ok(snapshot.get(id))
    }

    /// Delete an item
    pub async fn delete(&self, id: ItemId) -> StorageResult<WriteOutcome> {
        match self.apply(vec![Mutation::Delete(id)]).await {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(StorageError::Conflict(_)) => Ok(WriteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Change an item's timestamp
    pub async fn update_timestamp(&self, id: ItemId, timestamp: i64) -> StorageResult<WriteOutcome> {
        match self.apply(vec![Mutation::Update { id, timestamp }]).await {
            Ok(_) => Ok(WriteOutcome::Applied),
            Err(StorageError::Conflict(_)) => Ok(WriteOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Scan every item in timestamp order
    pub fn scan(&self, order: ScanOrder) -> Scan {
        self.snapshot().scan(order, TimeRange::ALL)
    }

    /// Scan items whose timestamp lies in `range` (inclusive)
    pub fn scan_range(&self, range: TimeRange, order: ScanOrder) -> Scan {
        self.snapshot().scan(order, range)
    }

    /// The last committed image
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let current = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    fn publish(&self, next: Snapshot) {
        let mut current = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(next);
    }

    /// Apply a batch atomically; returns the commit sequence number
    ///
    /// Either every mutation becomes visible and durable, or none does.
    /// Deletes and updates of ids that do not exist fail the batch with
    /// `Conflict`.
    pub(crate) async fn apply(&self, batch: Vec<Mutation>) -> StorageResult<u64> {
        let mut writer = self.writer.lock().await;
        writer.ensure_writable()?;

        let current = self.snapshot();
        if batch.is_empty() {
            return Ok(current.seq());
        }

        // Build the next image off to the side
        let mut next = (*current).clone();
        let mut mutations = Vec::with_capacity(batch.len());
        for mutation in &batch {
            match *mutation {
                Mutation::Insert(item) => {
                    if next.exists(item.id()) {
                        return Err(StorageError::CommitFailure(format!(
                            "item {} already exists",
                            item.id()
                        )));
                    }
                    mutations.push(WalMutation::Insert {
                        id: item.id(),
                        record: codec::encode(&item)?,
                    });
                    next.insert(item);
                }
                Mutation::Delete(id) => {
                    if !next.remove(id) {
                        return Err(StorageError::Conflict(id));
                    }
                    mutations.push(WalMutation::Delete { id });
                }
                Mutation::Update { id, timestamp } => {
                    if next.is_quarantined(id) {
                        return Err(StorageError::CorruptRecord {
                            id: Some(id),
                            reason: "record is quarantined".to_string(),
                        });
                    }
                    if !next.set_timestamp(id, timestamp) {
                        return Err(StorageError::Conflict(id));
                    }
                    mutations.push(WalMutation::Update { id, timestamp });
                }
            }
        }

        let seq = writer.next_seq;
        next.set_seq(seq);
        let frame = WalFrame {
            seq,
            next_id: self.next_id.load(Ordering::SeqCst),
            mutations,
        };

        // No await from here to the swap: a dropped future cannot split a commit
        let mark = writer.wal.len_bytes();
        if let Err(e) = writer.wal.append(&frame, &self.faults) {
            match writer.wal.rollback_to(mark) {
                Ok(()) => tracing::warn!("Commit {} rolled back: {}", seq, e),
                Err(rollback_err) => {
                    tracing::error!(
                        "Commit {} failed ({}) and the WAL could not be restored ({}); store is now read-only",
                        seq,
                        e,
                        rollback_err
                    );
                    writer.poisoned = true;
                }
            }
            return Err(as_commit_failure(e));
        }

        writer.next_seq += 1;
        self.publish(next);
        tracing::debug!("Committed batch {} ({} mutations)", seq, batch.len());

        Ok(seq)
    }

    /// Write a checkpoint and truncate the WAL
    pub async fn checkpoint(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(StorageError::Closed);
        }
        self.checkpoint_locked(&mut writer)
    }

    fn checkpoint_locked(&self, writer: &mut WriterState) -> StorageResult<()> {
        let snapshot = self.snapshot();
        let next_id = self.next_id.load(Ordering::SeqCst);

        checkpoint::write(&self.config.checkpoint_path(), &snapshot, next_id, &self.faults)?;
        self.faults.check(points::CHECKPOINT_BEFORE_WAL_TRUNCATE)?;
        writer.wal.truncate()?;

        if writer.poisoned {
            tracing::info!("WAL restored by checkpoint, accepting writes again");
            writer.poisoned = false;
        }

        tracing::info!(
            "Checkpoint written: {} items at seq {}",
            snapshot.len(),
            snapshot.seq()
        );
        Ok(())
    }

    /// Get store statistics
    pub async fn stats(&self) -> StoreStats {
        let snapshot = self.snapshot();
        let writer = self.writer.lock().await;

        let checkpoint_bytes = std::fs::metadata(self.config.checkpoint_path())
            .map(|m| m.len())
            .unwrap_or(0);

        StoreStats {
            item_count: snapshot.len(),
            quarantined_count: snapshot.quarantined_count(),
            wal_bytes: writer.wal.len_bytes(),
            wal_frames: writer.wal.frame_count(),
            checkpoint_bytes,
            last_seq: snapshot.seq(),
            next_id: self.next_id.load(Ordering::SeqCst),
            read_only: writer.poisoned || writer.closed,
        }
    }

    /// Start background checkpoint task
    pub fn start_background_checkpoint(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let check_interval = Duration::from_millis(store.config.checkpoint_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(check_interval);

            loop {
                ticker.tick().await;

                // Check shutdown
                if store.shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let wal_bytes = store.writer.lock().await.wal.len_bytes();
                if wal_bytes >= store.config.checkpoint_wal_bytes {
                    match store.checkpoint().await {
                        Ok(()) => {}
                        Err(StorageError::Closed) => break,
                        Err(e) => tracing::error!("Background checkpoint failed: {}", e),
                    }
                }
            }
        })
    }

    /// Shutdown the store gracefully
    ///
    /// Syncs the WAL and writes a final checkpoint. Reads keep working on
    /// the last snapshot; writes fail with `Closed`.
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.shutdown.store(true, Ordering::SeqCst);

        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Ok(());
        }

        let result = writer
            .wal
            .sync()
            .and_then(|()| self.checkpoint_locked(&mut writer));
        writer.closed = true;

        if let Err(e) = &result {
            tracing::error!("Final checkpoint failed, WAL kept for recovery: {}", e);
        }
        result
    }

    /// What recovery found when the store was opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Fault injection points for this instance
    pub fn fail_points(&self) -> &FailPoints {
        &self.faults
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }
}

fn as_commit_failure(e: StorageError) -> StorageError {
    match e {
        StorageError::CommitFailure(_) => e,
        other => StorageError::CommitFailure(other.to_string()),
    }
}

/// Copy `source` to `target` for inspection, keeping any earlier copy
///
/// A second copy gets the commit sequence as a suffix, then a counter.
fn preserve_copy(source: &Path, target: &Path, seq: u64) -> StorageResult<PathBuf> {
    let mut dest = target.to_path_buf();
    let mut attempt = 0u32;
    while dest.exists() {
        let mut name = target.as_os_str().to_owned();
        name.push(format!(".{}", seq));
        if attempt > 0 {
            name.push(format!(".{}", attempt));
        }
        dest = PathBuf::from(name);
        attempt += 1;
    }
    std::fs::copy(source, &dest)?;
    tracing::info!("Preserved corrupt data at {:?}", dest);
    Ok(dest)
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub item_count: usize,
    pub quarantined_count: usize,
    pub wal_bytes: u64,
    /// Frames written since the last checkpoint
    pub wal_frames: u64,
    pub checkpoint_bytes: u64,
    pub last_seq: u64,
    pub next_id: u64,
    pub read_only: bool,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {}, Quarantined: {}, WAL: {} frames ({} bytes), Checkpoint: {:.2} KB, Seq: {}, Next id: {}",
            self.item_count,
            self.quarantined_count,
            self.wal_frames,
            self.wal_bytes,
            self.checkpoint_bytes as f64 / 1024.0,
            self.last_seq,
            self.next_id
        )?;
        if self.read_only {
            write!(f, " (read-only)")?;
        }
        Ok(())
    }
}
