//! Checkpoint file: a full, self-describing image of the store
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (48 bytes)                       │
//! │   magic: [u8; 4] = "ITMS"               │
//! │   format_version: u16                   │
//! │   schema_version: u16                   │
//! │   field_count: u16                      │
//! │   record_count: u64                     │
//! │   next_id: u64                          │
//! │   last_seq: u64                         │
//! │   reserved: [u8; 10]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ RECORDS (record_count times)            │
//! │   id: u64                               │
//! │   len: u32                              │
//! │   payload: [u8; len] (record codec)     │
//! │   crc: u32 (CRC32 of id + len + payload)│
//! └─────────────────────────────────────────┘
//! ```
//!
//! A checkpoint is written to a temp file, synced, then renamed over the
//! previous one, so readers only ever see a complete image. Header damage is
//! fatal; a damaged record is skipped and reported by id.

use crate::storage::codec::{self, FIELD_COUNT, SCHEMA_VERSION};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::failpoint::{points, FailPoints};
use crate::storage::snapshot::Snapshot;
use crate::storage::types::{Item, ItemId};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Magic bytes for checkpoint file identification
const CHECKPOINT_MAGIC: [u8; 4] = *b"ITMS";

/// Current checkpoint format version
const FORMAT_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 48;

/// Upper bound for one record payload
const MAX_RECORD_LEN: usize = 1024 * 1024;

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub format_version: u16,
    pub schema_version: u16,
    pub field_count: u16,
    pub record_count: u64,
    /// Id allocator position when the checkpoint was taken
    pub next_id: u64,
    /// Last WAL sequence folded into this checkpoint
    pub last_seq: u64,
}

impl CheckpointHeader {
    pub fn new(record_count: u64, next_id: u64, last_seq: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            schema_version: SCHEMA_VERSION,
            field_count: FIELD_COUNT,
            record_count,
            next_id,
            last_seq,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
        buf[4..6].copy_from_slice(&self.format_version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.schema_version.to_le_bytes());
        buf[8..10].copy_from_slice(&self.field_count.to_le_bytes());
        buf[10..18].copy_from_slice(&self.record_count.to_le_bytes());
        buf[18..26].copy_from_slice(&self.next_id.to_le_bytes());
        buf[26..34].copy_from_slice(&self.last_seq.to_le_bytes());
        // bytes 34-43 reserved

        let checksum = crc32fast::hash(&buf[0..44]);
        buf[44..48].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    ///
    /// Any failure here concerns structural metadata, so the caller must
    /// refuse to open the store.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let stored_checksum = u32::from_le_bytes([buf[44], buf[45], buf[46], buf[47]]);
        let computed_checksum = crc32fast::hash(&buf[0..44]);
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Checkpoint header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != CHECKPOINT_MAGIC {
            return Err(StorageError::Corruption(format!(
                "Invalid checkpoint magic: {:?}",
                &buf[0..4]
            )));
        }

        let format_version = read_u16(buf, 4);
        if format_version != FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported checkpoint format version: {}",
                format_version
            )));
        }

        let schema_version = read_u16(buf, 6);
        if schema_version != SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found: schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        let field_count = read_u16(buf, 8);
        if field_count != FIELD_COUNT {
            return Err(StorageError::Corruption(format!(
                "Checkpoint declares {} fields, schema v{} has {}",
                field_count, SCHEMA_VERSION, FIELD_COUNT
            )));
        }

        Ok(Self {
            format_version,
            schema_version,
            field_count,
            record_count: read_u64(buf, 10),
            next_id: read_u64(buf, 18),
            last_seq: read_u64(buf, 26),
        })
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// A record that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// Id the record claimed to have
    pub id: ItemId,
    /// False when the id came from bytes that failed their checksum
    pub id_verified: bool,
    pub reason: String,
}

impl SkippedRecord {
    pub(crate) fn new(id: ItemId, reason: impl Into<String>) -> Self {
        Self {
            id,
            id_verified: true,
            reason: reason.into(),
        }
    }

    fn unverified(id: ItemId, reason: impl Into<String>) -> Self {
        Self {
            id_verified: false,
            ..Self::new(id, reason)
        }
    }
}

/// Contents of a checkpoint file
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub header: CheckpointHeader,
    pub items: Vec<Item>,
    pub skipped: Vec<SkippedRecord>,
}

/// Write `snapshot` as the new checkpoint at `path`
pub fn write(
    path: &Path,
    snapshot: &Snapshot,
    next_id: u64,
    faults: &FailPoints,
) -> StorageResult<()> {
    let tmp_path = path.with_extension("dat.tmp");

    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let header = CheckpointHeader::new(snapshot.len() as u64, next_id, snapshot.seq());
        writer.write_all(&header.to_bytes())?;

        for item in snapshot.iter() {
            let payload = codec::encode(&item)?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&item.id().get().to_le_bytes());
            hasher.update(&(payload.len() as u32).to_le_bytes());
            hasher.update(&payload);
            let crc = hasher.finalize();

            writer.write_all(&item.id().get().to_le_bytes())?;
            writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.write_all(&crc.to_le_bytes())?;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    faults.check(points::CHECKPOINT_BEFORE_RENAME)?;
    std::fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;

    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> StorageResult<()> {
    Ok(())
}

/// Load the checkpoint at `path`, or `None` if there is none yet
pub fn load(path: &Path) -> StorageResult<Option<LoadedCheckpoint>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut reader = BufReader::new(File::open(path)?);

    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).map_err(|e| {
        StorageError::Corruption(format!("Checkpoint header unreadable: {}", e))
    })?;
    let header = CheckpointHeader::from_bytes(&header_buf)?;

    let mut items = Vec::with_capacity(header.record_count.min(1 << 20) as usize);
    let mut skipped = Vec::new();

    for index in 0..header.record_count {
        let (id, len_buf, payload, stored_crc) = read_record(&mut reader).map_err(|e| {
            StorageError::Corruption(format!(
                "Checkpoint truncated at record {} of {}: {}",
                index, header.record_count, e
            ))
        })?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&id.get().to_le_bytes());
        hasher.update(&len_buf);
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            let id = likely_id(id, &payload, header.next_id);
            skipped.push(SkippedRecord::unverified(id, "checksum mismatch"));
            continue;
        }

        match codec::decode(&payload) {
            Ok(item) if item.id() == id => items.push(item),
            Ok(item) => skipped.push(SkippedRecord::new(
                id,
                format!("frame id {} does not match record id {}", id, item.id()),
            )),
            Err(e) => skipped.push(SkippedRecord::new(id, e.with_id(id).to_string())),
        }
    }

    Ok(Some(LoadedCheckpoint {
        header,
        items,
        skipped,
    }))
}

/// Best guess at the id of a record that failed its checksum
///
/// Prefers the id stored inside the payload when the frame id is out of the
/// allocated range. Either may be damaged, so the result is never trusted to
/// move the id allocator.
fn likely_id(framed: ItemId, payload: &[u8], next_id: u64) -> ItemId {
    if framed.get() < next_id {
        return framed;
    }
    match codec::decode(payload) {
        Ok(item) if item.id().get() < next_id => item.id(),
        _ => framed,
    }
}

fn read_record<R: Read>(reader: &mut R) -> std::io::Result<(ItemId, [u8; 4], Vec<u8>, u32)> {
    let mut id_buf = [0u8; 8];
    reader.read_exact(&mut id_buf)?;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("record length too large: {}", len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;

    Ok((
        ItemId::new(u64::from_le_bytes(id_buf)),
        len_buf,
        payload,
        u32::from_le_bytes(crc_buf),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::tempdir;

    fn snapshot_of(items: &[(u64, i64)]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for &(id, ts) in items {
            snapshot.insert(Item::new(ItemId::new(id), ts));
        }
        snapshot.set_seq(7);
        snapshot
    }

    #[test]
    fn test_header_roundtrip() {
        let header = CheckpointHeader::new(3, 10, 42);
        let restored = CheckpointHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_header_schema_mismatch() {
        let mut header = CheckpointHeader::new(0, 1, 0);
        header.schema_version = SCHEMA_VERSION + 1;
        let bytes = header.to_bytes();

        assert!(matches!(
            CheckpointHeader::from_bytes(&bytes),
            Err(StorageError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_header_checksum_mismatch() {
        let mut bytes = CheckpointHeader::new(1, 2, 3).to_bytes();
        bytes[12] ^= 0xFF;
        assert!(matches!(
            CheckpointHeader::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        let snapshot = snapshot_of(&[(1, 300), (2, 100), (3, 200)]);

        write(&path, &snapshot, 4, &FailPoints::new()).unwrap();
        assert!(!path.with_extension("dat.tmp").exists());

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.header.record_count, 3);
        assert_eq!(loaded.header.next_id, 4);
        assert_eq!(loaded.header.last_seq, 7);
        assert!(loaded.skipped.is_empty());

        let mut ids: Vec<u64> = loaded.items.iter().map(|i| i.id().get()).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("items.dat")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        let snapshot = snapshot_of(&[(1, 100), (2, 200), (3, 300)]);
        write(&path, &snapshot, 4, &FailPoints::new()).unwrap();

        // Records are 8 + 4 + 20 + 4 = 36 bytes; damage the second one's payload
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 36 + 14)).unwrap();
            file.write_all(&[0xAB]).unwrap();
        }

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.skipped.len(), 1);
        assert_eq!(loaded.skipped[0].id, ItemId::new(2));
        assert!(!loaded.skipped[0].id_verified);
    }

    #[test]
    fn test_damaged_id_recovered_from_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        write(&path, &snapshot_of(&[(1, 100), (2, 200), (3, 300)]), 4, &FailPoints::new()).unwrap();

        // Overwrite the third record's framed id
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 2 * 36)).unwrap();
            file.write_all(&[0xFF; 8]).unwrap();
        }

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(
            loaded.skipped,
            vec![SkippedRecord::unverified(ItemId::new(3), "checksum mismatch")]
        );
    }

    #[test]
    fn test_record_with_unknown_schema_version_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        write(&path, &snapshot_of(&[(1, 100), (2, 200), (3, 300)]), 4, &FailPoints::new()).unwrap();

        // Bump the second record's payload version and re-seal its checksum
        let mut bytes = std::fs::read(&path).unwrap();
        let record = HEADER_SIZE + 36;
        bytes[record + 12..record + 14].copy_from_slice(&7u16.to_le_bytes());
        let crc = crc32fast::hash(&bytes[record..record + 32]);
        bytes[record + 32..record + 36].copy_from_slice(&crc.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        let ids: Vec<ItemId> = loaded.items.iter().map(|i| i.id()).collect();
        assert!(!ids.contains(&ItemId::new(2)));
        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.skipped.len(), 1);

        let skipped = &loaded.skipped[0];
        assert_eq!(skipped.id, ItemId::new(2));
        assert!(skipped.id_verified);
        assert!(skipped.reason.contains("found version 7"), "{}", skipped.reason);
    }

    #[test]
    fn test_truncated_checkpoint_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        write(&path, &snapshot_of(&[(1, 100), (2, 200)]), 3, &FailPoints::new()).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();

        assert!(matches!(load(&path), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_failed_rename_keeps_previous_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.dat");
        let faults = FailPoints::new();

        write(&path, &snapshot_of(&[(1, 100)]), 2, &faults).unwrap();

        faults.arm_once(points::CHECKPOINT_BEFORE_RENAME);
        let result = write(&path, &snapshot_of(&[(1, 100), (2, 200)]), 3, &faults);
        assert!(result.is_err());

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.header.next_id, 2);
    }
}
