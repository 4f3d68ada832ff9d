//! Record codec: versioned binary layout for a single `Item`
//!
//! Layout:
//! ```text
//! ┌──────────────────────┬──────────────────────┬───────────────────────────┐
//! │ schema_version: u16  │ field_count: u16     │ body (bincode, fixint LE) │
//! └──────────────────────┴──────────────────────┴───────────────────────────┘
//! ```
//!
//! Version 1 body: `id: u64`, `timestamp: i64` (16 bytes).
//!
//! Unknown versions are rejected with `SchemaMismatch` instead of being
//! guessed at; a known version with the wrong shape is `CorruptRecord`.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Item, ItemId};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Schema version written by this build
pub const SCHEMA_VERSION: u16 = 1;

/// Number of fields in a version 1 record
pub const FIELD_COUNT: u16 = 2;

/// Size of the version + field count prefix
const PREFIX_LEN: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct ItemRecordV1 {
    id: u64,
    timestamp: i64,
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn corrupt(reason: impl Into<String>) -> StorageError {
    StorageError::CorruptRecord {
        id: None,
        reason: reason.into(),
    }
}

/// Encode an item into its durable byte representation
pub fn encode(item: &Item) -> StorageResult<Vec<u8>> {
    let record = ItemRecordV1 {
        id: item.id().get(),
        timestamp: item.timestamp(),
    };
    let body = body_options().serialize(&record)?;

    let mut buf = Vec::with_capacity(PREFIX_LEN + body.len());
    buf.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    buf.extend_from_slice(&FIELD_COUNT.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode an item previously produced by [`encode`]
pub fn decode(bytes: &[u8]) -> StorageResult<Item> {
    if bytes.len() < PREFIX_LEN {
        return Err(corrupt(format!(
            "record too short: {} bytes",
            bytes.len()
        )));
    }

    let version = u16::from_le_bytes([bytes[0], bytes[1]]);
    if version != SCHEMA_VERSION {
        return Err(StorageError::SchemaMismatch {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    let field_count = u16::from_le_bytes([bytes[2], bytes[3]]);
    if field_count != FIELD_COUNT {
        return Err(corrupt(format!(
            "expected {} fields for schema v{}, found {}",
            FIELD_COUNT, SCHEMA_VERSION, field_count
        )));
    }

    let record: ItemRecordV1 = body_options()
        .deserialize(&bytes[PREFIX_LEN..])
        .map_err(|e| corrupt(format!("invalid v{} body: {}", SCHEMA_VERSION, e)))?;

    Ok(Item::new(ItemId::new(record.id), record.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Item {
        Item::new(ItemId::new(42), 1_742_083_200_000)
    }

    #[test]
    fn test_roundtrip_edge_timestamps() {
        let timestamps = [i64::MIN, -1, 0, 1, 1_742_083_200_000, i64::MAX];
        for (i, ts) in timestamps.iter().enumerate() {
            let item = Item::new(ItemId::new(i as u64 + 1), *ts);
            let decoded = decode(&encode(&item).unwrap()).unwrap();
            assert_eq!(decoded, item);
        }
    }

    #[test]
    fn test_layout_is_self_describing() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(bytes.len(), PREFIX_LEN + 16);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), SCHEMA_VERSION);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), FIELD_COUNT);
    }

    #[test]
    fn test_unknown_version_is_schema_mismatch() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0..2].copy_from_slice(&2u16.to_le_bytes());

        match decode(&bytes) {
            Err(StorageError::SchemaMismatch { found, supported }) => {
                assert_eq!(found, 2);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_field_count_is_corrupt() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[2..4].copy_from_slice(&3u16.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(StorageError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_truncated_is_corrupt() {
        let bytes = encode(&sample()).unwrap();
        for len in [0, 3, PREFIX_LEN, bytes.len() - 1] {
            assert!(
                matches!(decode(&bytes[..len]), Err(StorageError::CorruptRecord { .. })),
                "length {} should be rejected",
                len
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut bytes = encode(&sample()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes),
            Err(StorageError::CorruptRecord { .. })
        ));
    }
}
