//! The meta index: key → item record, with snapshot persistence.
//!
//! Each store owns exactly one [`MetaIndex`]. It is persisted as a single
//! JSON snapshot written atomically at clean shutdown and consumed (loaded
//! then deleted) at startup, so a crash after a partial rewrite can never
//! resurrect a stale snapshot.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::block::BlockId;
use crate::cache::key::Key;
use crate::error::CacheError;

/// Upper bound on the stored raw (untransformed) key.
pub const MAX_RAW_KEY_LEN: usize = 256;

/// Metadata describing a stored object's location and attributes. Payload
/// bytes live in the owning block, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Primary identifier.
    pub id: Key,

    /// Optional secondary identifier for batch deletion by group.
    pub group: Option<Key>,

    /// Original untransformed key, used for regex batch deletion.
    /// At most [`MAX_RAW_KEY_LEN`] bytes.
    pub raw_key: Bytes,

    /// Header segment length in bytes.
    pub head_len: u64,

    /// Body segment length in bytes.
    pub body_len: u64,

    /// Owning block.
    pub block_id: BlockId,

    /// Byte offset of this item within its block.
    pub offset: u64,

    /// Reserved for TTL support; round-tripped but never enforced.
    pub expire: u64,

    /// True from space reservation until the payload copy completes.
    /// A record still writing is invisible to readers and is skipped when
    /// dumping a snapshot.
    pub writing: bool,
}

impl ItemRecord {
    /// Combined header + body length.
    pub fn total_len(&self) -> u64 {
        self.head_len + self.body_len
    }
}

/// In-memory mapping from [`Key`] to [`ItemRecord`].
#[derive(Debug, Default)]
pub struct MetaIndex {
    items: HashMap<Key, ItemRecord>,
}

impl MetaIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for its key, returning the displaced
    /// record if any.
    pub fn insert(&mut self, record: ItemRecord) -> Option<ItemRecord> {
        self.items.insert(record.id, record)
    }

    pub fn get(&self, key: &Key) -> Option<&ItemRecord> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut ItemRecord> {
        self.items.get_mut(key)
    }

    /// Remove the record for `key`. Idempotent; returns whether a record
    /// was present.
    pub fn remove(&mut self, key: &Key) -> bool {
        self.items.remove(key).is_some()
    }

    /// Remove every record matching the predicate, returning the count.
    pub fn remove_matching(&mut self, matches: impl Fn(&ItemRecord) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|_, record| !matches(record));
        before - self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemRecord> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Load a snapshot and delete it.
    ///
    /// An absent snapshot is normal (`Ok(None)`); a present but unparseable
    /// one is fatal to startup.
    pub fn load(path: &Path) -> Result<Option<Self>, CacheError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let records: Vec<ItemRecord> =
            serde_json::from_slice(&data).map_err(|source| CacheError::Snapshot {
                path: path.to_path_buf(),
                source,
            })?;

        // Consume the snapshot so a later crash cannot resurrect it.
        fs::remove_file(path)?;

        let mut index = Self::new();
        for record in records {
            index.insert(record);
        }
        Ok(Some(index))
    }

    /// Write a snapshot atomically (temp file, then rename). Records still
    /// marked writing are excluded: their payload never completed.
    pub fn dump(&self, path: &Path) -> Result<(), CacheError> {
        let records: Vec<&ItemRecord> = self.items.values().filter(|r| !r.writing).collect();
        let data = serde_json::to_vec(&records).map_err(|source| CacheError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: u8, block_id: BlockId) -> ItemRecord {
        ItemRecord {
            id: Key::from([id; 16]),
            group: Some(Key::from([0xaa; 16])),
            raw_key: Bytes::from_static(b"/videos/clip.mp4"),
            head_len: 32,
            body_len: 1000,
            block_id,
            offset: 0,
            expire: 0,
            writing: false,
        }
    }

    #[test]
    fn test_insert_overwrites_same_key() {
        let mut index = MetaIndex::new();
        index.insert(record(1, 0));
        let displaced = index.insert(record(1, 5));
        assert!(displaced.is_some());
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&Key::from([1; 16])).unwrap().block_id, 5);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut index = MetaIndex::new();
        index.insert(record(1, 0));
        assert!(index.remove(&Key::from([1; 16])));
        assert!(!index.remove(&Key::from([1; 16])));
    }

    #[test]
    fn test_remove_matching_counts() {
        let mut index = MetaIndex::new();
        index.insert(record(1, 0));
        index.insert(record(2, 0));
        index.insert(record(3, 1));
        let removed = index.remove_matching(|r| r.block_id == 0);
        assert_eq!(removed, 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_and_consumption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");

        let mut index = MetaIndex::new();
        index.insert(record(1, 0));
        index.insert(record(2, 3));
        index.dump(&path).unwrap();

        let loaded = MetaIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        let rec = loaded.get(&Key::from([2; 16])).unwrap();
        assert_eq!(rec.block_id, 3);
        assert_eq!(rec.head_len, 32);
        assert_eq!(rec.body_len, 1000);
        assert_eq!(rec.group, Some(Key::from([0xaa; 16])));
        assert_eq!(&rec.raw_key[..], b"/videos/clip.mp4");

        // The snapshot was consumed by the load.
        assert!(!path.exists());
        assert!(MetaIndex::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_skips_writing_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");

        let mut index = MetaIndex::new();
        index.insert(record(1, 0));
        let mut half_written = record(2, 0);
        half_written.writing = true;
        index.insert(half_written);
        index.dump(&path).unwrap();

        let loaded = MetaIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get(&Key::from([2; 16])).is_none());
    }

    #[test]
    fn test_corrupt_snapshot_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("index.json");
        fs::write(&path, b"{ not json").unwrap();

        let err = MetaIndex::load(&path).unwrap_err();
        assert!(matches!(err, CacheError::Snapshot { .. }));
    }
}
