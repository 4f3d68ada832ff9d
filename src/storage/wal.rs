//! Write-Ahead Log (WAL) for durability guarantees
//!
//! Every committed batch becomes exactly one frame, so a batch is either
//! fully present in the log or not at all. On recovery, frames are replayed
//! in order on top of the last checkpoint; a damaged or torn tail is cut off.
//!
//! Format per frame:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode-serialized `WalFrame`)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::failpoint::{points, FailPoints};
use crate::storage::types::ItemId;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Upper bound for a single frame's payload
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Sync strategy for WAL writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// Fsync after every frame; a successful commit survives power loss
    #[default]
    EveryWrite,
    /// Fsync once enough bytes accumulate; recent commits may be lost on power loss
    Batched,
    /// No fsync, rely on the OS page cache
    None,
}

impl FromStr for WalSyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "every_write" | "everywrite" | "always" => Ok(WalSyncMode::EveryWrite),
            "batched" => Ok(WalSyncMode::Batched),
            "none" | "off" => Ok(WalSyncMode::None),
            other => Err(format!("unknown WAL sync mode: {}", other)),
        }
    }
}

/// A single logged mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalMutation {
    /// A new item; `record` is its codec encoding
    Insert { id: ItemId, record: Vec<u8> },
    /// Removal of an item
    Delete { id: ItemId },
    /// Timestamp change of an existing item
    Update { id: ItemId, timestamp: i64 },
}

/// One committed batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalFrame {
    /// Commit sequence number, strictly increasing
    pub seq: u64,
    /// Id allocator position at commit time
    pub next_id: u64,
    /// Mutations in application order
    pub mutations: Vec<WalMutation>,
}

/// Frames recovered when a WAL is opened
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Intact frames, in log order
    pub frames: Vec<WalFrame>,
    /// Bytes cut from the end of the file (torn or corrupt tail)
    pub discarded_bytes: u64,
}

/// Write-Ahead Log for durability
pub struct WriteAheadLog {
    /// File handle for writing (append mode)
    writer: BufWriter<File>,
    /// Path to WAL file
    path: PathBuf,
    /// Number of frames in the file
    frame_count: u64,
    /// Length of the file in bytes, counting only complete frames
    len: u64,
    /// Bytes written since last sync
    bytes_since_sync: usize,
    /// Sync mode
    sync_mode: WalSyncMode,
    /// Batch sync threshold (bytes)
    sync_threshold: usize,
}

impl WriteAheadLog {
    /// Open or create a WAL file, recovering any frames it already holds
    ///
    /// A torn or corrupt tail is truncated so that new frames are appended
    /// directly after the last intact one.
    pub fn open(
        path: impl AsRef<Path>,
        sync_mode: WalSyncMode,
    ) -> StorageResult<(Self, WalReplay)> {
        let path = path.as_ref().to_path_buf();

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (replay, valid_len) = Self::replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if replay.discarded_bytes > 0 {
            tracing::warn!(
                "Truncating {} bytes of torn WAL tail in {:?}",
                replay.discarded_bytes,
                path
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let wal = Self {
            writer: BufWriter::new(file),
            path,
            frame_count: replay.frames.len() as u64,
            len: valid_len,
            bytes_since_sync: 0,
            sync_mode,
            sync_threshold: 64 * 1024, // 64KB default batch
        };

        Ok((wal, replay))
    }

    /// Read every intact frame; returns the frames and the byte length they span
    fn replay(path: &Path) -> StorageResult<(WalReplay, u64)> {
        if !path.exists() {
            return Ok((WalReplay::default(), 0));
        }

        let file_len = std::fs::metadata(path)?.len();
        let mut reader = BufReader::new(File::open(path)?);
        let mut frames: Vec<WalFrame> = Vec::new();
        let mut valid_len = 0u64;

        loop {
            match Self::read_frame_from(&mut reader) {
                Ok(Some((frame, size))) => {
                    if let Some(prev) = frames.last() {
                        if frame.seq <= prev.seq {
                            tracing::warn!(
                                "WAL sequence regressed at frame {} ({} after {}), stopping replay",
                                frames.len(),
                                frame.seq,
                                prev.seq
                            );
                            break;
                        }
                    }
                    valid_len += size as u64;
                    frames.push(frame);
                }
                Ok(None) => break, // EOF
                Err(e) => {
                    tracing::warn!("WAL replay stopped at frame {}: {}", frames.len(), e);
                    break;
                }
            }
        }

        let replay = WalReplay {
            frames,
            discarded_bytes: file_len - valid_len,
        };
        Ok((replay, valid_len))
    }

    /// Append a frame to the WAL
    ///
    /// On error the file may hold a partial frame; call [`rollback_to`]
    /// with the length observed before the append to remove it.
    ///
    /// [`rollback_to`]: WriteAheadLog::rollback_to
    pub fn append(&mut self, frame: &WalFrame, faults: &FailPoints) -> StorageResult<()> {
        let data = bincode::serialize(frame)?;
        if data.len() > MAX_FRAME_LEN {
            return Err(StorageError::CommitFailure(format!(
                "batch too large for one WAL frame: {} bytes",
                data.len()
            )));
        }

        // Calculate CRC
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(data.len() as u32).to_le_bytes());
        hasher.update(&data);
        let crc = hasher.finalize();

        // Frame: length (4) + data (N) + crc (4)
        let mut buf = Vec::with_capacity(8 + data.len());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&crc.to_le_bytes());

        self.write_frame(&buf, faults)?;

        self.len += buf.len() as u64;
        self.frame_count += 1;
        Ok(())
    }

    fn write_frame(&mut self, buf: &[u8], faults: &FailPoints) -> io::Result<()> {
        faults.check(points::WAL_BEFORE_APPEND)?;

        if let Err(e) = faults.check(points::WAL_TORN_APPEND) {
            self.writer.write_all(&buf[..buf.len() / 2])?;
            self.writer.flush()?;
            return Err(e);
        }

        self.writer.write_all(buf)?;
        self.writer.flush()?;
        self.bytes_since_sync += buf.len();

        faults.check(points::WAL_BEFORE_FSYNC)?;
        self.maybe_sync()
    }

    /// Conditionally sync based on mode and threshold
    fn maybe_sync(&mut self) -> io::Result<()> {
        match self.sync_mode {
            WalSyncMode::EveryWrite => self.sync_file(),
            WalSyncMode::Batched => {
                if self.bytes_since_sync >= self.sync_threshold {
                    self.sync_file()
                } else {
                    Ok(())
                }
            }
            WalSyncMode::None => Ok(()),
        }
    }

    fn sync_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> StorageResult<()> {
        self.sync_file()?;
        Ok(())
    }

    /// Cut the file back to `len` bytes, discarding anything buffered
    ///
    /// Used to remove a partially written frame after a failed append.
    pub fn rollback_to(&mut self, len: u64) -> StorageResult<()> {
        let reopened = OpenOptions::new().append(true).open(&self.path)?;
        let previous = std::mem::replace(&mut self.writer, BufWriter::new(reopened));

        // into_parts drops the buffer instead of flushing it
        let (file, _unflushed) = previous.into_parts();
        file.set_len(len)?;
        file.sync_all()?;

        self.len = len;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Truncate the WAL (after a successful checkpoint)
    pub fn truncate(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.rollback_to(0)?;
        self.frame_count = 0;
        Ok(())
    }

    /// Number of frames in the WAL
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Length in bytes of the intact frames
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    /// Check if WAL has frames not yet folded into a checkpoint
    pub fn has_pending(&self) -> bool {
        self.frame_count > 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a single frame; returns the frame and its on-disk size
    fn read_frame_from<R: Read>(reader: &mut R) -> StorageResult<Option<(WalFrame, usize)>> {
        // Read length
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_FRAME_LEN {
            return Err(StorageError::Corruption(format!(
                "WAL frame length too large: {}",
                len
            )));
        }

        // Read data
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        // Read CRC
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        // Verify CRC
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(StorageError::Corruption(format!(
                "WAL CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            )));
        }

        let frame: WalFrame = bincode::deserialize(&data)?;
        Ok(Some((frame, 8 + len)))
    }
}
