//! Per-tier store: block allocation, lookup, deletion, eviction.
//!
//! A [`Store`] owns one [`MetaIndex`], the set of live mmap blocks for its
//! tier, and a single append cursor. Allocation is sequential within the
//! current block; a new block is created when the current one lacks room,
//! and items larger than the nominal block size get a dedicated oversized
//! block. Space is reclaimed only at whole-block granularity, FIFO by block
//! creation order.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::block::{Block, BlockId, ItemHandle, WriteReservation};
use crate::cache::index::{ItemRecord, MetaIndex, MAX_RAW_KEY_LEN};
use crate::cache::key::Key;
use crate::cache::manager::Tier;
use crate::config::TierConfig;
use crate::error::CacheError;

/// Usage accounting for one store.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of live blocks.
    pub block_count: usize,
    /// Sum of live block capacities in bytes.
    pub bytes_used: u64,
    /// Capacity budget in bytes.
    pub capacity: u64,
}

/// The active append position.
struct Cursor {
    block: Arc<Block>,
    offset: u64,
}

/// One storage tier's engine.
pub struct Store {
    tier: Tier,
    dir: PathBuf,
    snapshot_path: PathBuf,
    cap: u64,
    block_size: u64,
    /// Sum of live block capacities.
    size: u64,
    next_block_id: BlockId,
    cursor: Option<Cursor>,
    index: MetaIndex,
    blocks: HashMap<BlockId, Arc<Block>>,
}

impl Store {
    /// Open a store: load and consume the index snapshot, then map every
    /// block file the surviving records reference before accepting traffic.
    ///
    /// Records whose block file has gone missing are dropped with a logged
    /// warning. A present-but-corrupt snapshot or an unmappable block file
    /// aborts startup.
    pub fn open(tier: Tier, cfg: &TierConfig) -> Result<Self, CacheError> {
        if cfg.block_size == 0 {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block_size must be non-zero",
            )));
        }
        fs::create_dir_all(&cfg.dir)?;

        let snapshot_path = cfg.snapshot_file();
        let mut index = match MetaIndex::load(&snapshot_path)? {
            Some(index) => {
                info!(tier = %tier, items = index.len(), "loaded index snapshot");
                index
            }
            None => {
                warn!(tier = %tier, "no index snapshot found, starting empty");
                MetaIndex::new()
            }
        };

        let referenced: BTreeSet<BlockId> = index.iter().map(|r| r.block_id).collect();
        let mut blocks = HashMap::new();
        let mut next_block_id = 0;
        for id in referenced {
            next_block_id = next_block_id.max(id + 1);
            let path = cfg.dir.join(crate::cache::block::file_name(id));
            match Block::open(path, id) {
                Ok(block) => {
                    // The file may have been truncated between runs; records
                    // whose extent no longer fits the mapping must never
                    // reach a reader.
                    let capacity = block.capacity() as u64;
                    let dropped = index
                        .remove_matching(|r| r.block_id == id && r.offset + r.total_len() > capacity);
                    if dropped > 0 {
                        warn!(
                            tier = %tier,
                            block_id = id,
                            capacity,
                            dropped,
                            "block file shorter than recorded extents, dropping out-of-range records"
                        );
                    }
                    blocks.insert(id, block);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let dropped = index.remove_matching(|r| r.block_id == id);
                    warn!(
                        tier = %tier,
                        block_id = id,
                        dropped,
                        "block file missing, dropping its stale records"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Self::sweep_orphan_blocks(tier, &cfg.dir, &blocks)?;

        let size = blocks.values().map(|b| b.capacity() as u64).sum();
        info!(
            tier = %tier,
            blocks = blocks.len(),
            bytes_used = size,
            capacity = cfg.capacity,
            "store open"
        );

        Ok(Self {
            tier,
            dir: cfg.dir.clone(),
            snapshot_path,
            cap: cfg.capacity,
            block_size: cfg.block_size,
            size,
            next_block_id,
            cursor: None,
            index,
            blocks,
        })
    }

    /// Dump the index snapshot atomically. Block files stay in place.
    pub fn close(&self) -> Result<(), CacheError> {
        self.index.dump(&self.snapshot_path)?;
        info!(tier = %self.tier, items = self.index.len(), "store closed, snapshot written");
        Ok(())
    }

    /// Reserve contiguous space for an item and record it in the index.
    ///
    /// The returned reservation must be filled (header bytes, then body
    /// bytes) and committed; on failure the caller rolls back with
    /// [`delete`](Self::delete). Until commit the item is invisible to
    /// readers.
    pub fn add(
        &mut self,
        key: Key,
        group: Option<Key>,
        raw_key: Bytes,
        head_len: u64,
        body_len: u64,
    ) -> Result<WriteReservation, CacheError> {
        if raw_key.len() > MAX_RAW_KEY_LEN {
            return Err(CacheError::RawKeyTooLong {
                len: raw_key.len(),
                limit: MAX_RAW_KEY_LEN,
            });
        }
        let total = head_len
            .checked_add(body_len)
            .and_then(|t| usize::try_from(t).ok())
            .ok_or(CacheError::ObjectTooLarge { head_len, body_len })? as u64;

        let (block, offset) = match &self.cursor {
            Some(cur)
                if total <= self.block_size && cur.offset + total <= self.block_size =>
            {
                (cur.block.clone(), cur.offset)
            }
            _ => {
                // Oversized items get a block of exactly their size.
                let capacity = if total > self.block_size {
                    total
                } else {
                    self.block_size
                };
                (self.new_block(capacity)?, 0)
            }
        };
        self.cursor = Some(Cursor {
            block: block.clone(),
            offset: offset + total,
        });

        self.index.insert(ItemRecord {
            id: key,
            group,
            raw_key,
            head_len,
            body_len,
            block_id: block.id(),
            offset,
            expire: 0,
            writing: true,
        });

        Ok(WriteReservation::new(
            key,
            block,
            offset as usize,
            total as usize,
        ))
    }

    /// Mark the write complete, making the item visible to readers.
    ///
    /// A stale reservation (its record was overwritten by a newer `add` for
    /// the same key) is a no-op: it must not publish someone else's
    /// half-written record.
    pub fn commit(&mut self, reservation: &WriteReservation) {
        if let Some(record) = self.index.get_mut(&reservation.key()) {
            if record.block_id == reservation.block_id()
                && record.offset == reservation.offset() as u64
            {
                record.writing = false;
            }
        }
    }

    /// Roll back a reservation: remove its record iff the index still
    /// points at the reservation's location. A stale reservation (its
    /// record was displaced by a newer `add`) is a no-op, so aborting never
    /// destroys someone else's write.
    pub fn abort(&mut self, reservation: &WriteReservation) -> bool {
        if let Some(record) = self.index.get(&reservation.key()) {
            if record.block_id == reservation.block_id()
                && record.offset == reservation.offset() as u64
            {
                return self.index.remove(&reservation.key());
            }
        }
        false
    }

    /// Look up an item. Absent keys and records whose write has not
    /// completed both read as a miss.
    pub fn get(&self, key: &Key) -> Option<(ItemRecord, ItemHandle)> {
        let record = self.index.get(key)?;
        if record.writing {
            return None;
        }
        let Some(block) = self.blocks.get(&record.block_id) else {
            debug!(tier = %self.tier, key = %key, block_id = record.block_id, "record references no live block");
            return None;
        };
        let handle = ItemHandle::new(
            block.clone(),
            record.offset as usize,
            record.head_len as usize,
            record.body_len as usize,
        );
        Some((record.clone(), handle))
    }

    /// Remove the record for `key`. Idempotent. Block space is reclaimed
    /// only when the whole block is evicted.
    pub fn delete(&mut self, key: &Key) -> bool {
        self.index.remove(key)
    }

    /// Remove every record matching the predicate, returning the count.
    pub fn delete_batch(&mut self, matches: impl Fn(&ItemRecord) -> bool) -> usize {
        self.index.remove_matching(matches)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            block_count: self.blocks.len(),
            bytes_used: self.size,
            capacity: self.cap,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Remove `*.blk` files no surviving record references. Blocks whose
    /// items were all deleted before the last shutdown are never remapped,
    /// so without this they would linger on disk indefinitely.
    fn sweep_orphan_blocks(
        tier: Tier,
        dir: &std::path::Path,
        live: &HashMap<BlockId, Arc<Block>>,
    ) -> Result<(), CacheError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("blk") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| u64::from_str_radix(s, 16).ok());
            let Some(id) = id else { continue };
            if !live.contains_key(&id) {
                fs::remove_file(&path)?;
                warn!(
                    tier = %tier,
                    block_id = id,
                    path = %path.display(),
                    "removed unreferenced block file"
                );
            }
        }
        Ok(())
    }

    /// Create a block of `capacity` bytes, evicting old blocks first so the
    /// new total stays within budget where possible.
    fn new_block(&mut self, capacity: u64) -> Result<Arc<Block>, CacheError> {
        self.evict_to_fit(capacity);

        let id = self.next_block_id;
        let block = Block::create(&self.dir, id, capacity as usize)?;
        self.next_block_id += 1;
        self.blocks.insert(id, block.clone());
        self.size += capacity;

        if self.size > self.cap {
            // Only possible when this block alone exceeds the budget.
            warn!(
                tier = %self.tier,
                block_id = id,
                capacity,
                cap = self.cap,
                "block exceeds tier capacity budget"
            );
        }
        debug!(tier = %self.tier, block_id = id, capacity, "new block");
        Ok(block)
    }

    /// Evict oldest blocks (minimum id) until `size + incoming <= cap` or
    /// no live blocks remain. FIFO by creation order: access recency never
    /// protects a block.
    fn evict_to_fit(&mut self, incoming: u64) {
        let budget = self.cap.saturating_sub(incoming);
        while self.size > budget {
            let Some(oldest) = self.blocks.keys().min().copied() else {
                break;
            };
            let Some(block) = self.blocks.remove(&oldest) else {
                break;
            };
            if self
                .cursor
                .as_ref()
                .is_some_and(|c| c.block.id() == oldest)
            {
                self.cursor = None;
            }

            let removed = self.index.remove_matching(|r| r.block_id == oldest);
            self.size -= block.capacity() as u64;
            block.doom();

            warn!(
                tier = %self.tier,
                block_id = oldest,
                removed_items = removed,
                freed = block.capacity(),
                bytes_used = self.size,
                "evicting oldest block"
            );
            if Arc::strong_count(&block) > 1 {
                debug!(
                    tier = %self.tier,
                    block_id = oldest,
                    "readers still hold the block, reclamation deferred to last handle drop"
                );
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("tier", &self.tier)
            .field("cap", &self.cap)
            .field("block_size", &self.block_size)
            .field("size", &self.size)
            .field("blocks", &self.blocks.len())
            .field("items", &self.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir, capacity: u64, block_size: u64) -> Store {
        Store::open(
            Tier::Mem,
            &TierConfig {
                dir: tmp.path().to_path_buf(),
                capacity,
                block_size,
                snapshot_path: None,
            },
        )
        .unwrap()
    }

    fn put(store: &mut Store, key: Key, head: &[u8], body: &[u8]) {
        let mut res = store
            .add(
                key,
                None,
                Bytes::new(),
                head.len() as u64,
                body.len() as u64,
            )
            .unwrap();
        res.buf()[..head.len()].copy_from_slice(head);
        res.buf()[head.len()..].copy_from_slice(body);
        store.commit(&res);
    }

    #[test]
    fn test_oversized_item_gets_exact_block() {
        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp, 1 << 20, 1024);

        let key = Key::from([1; 16]);
        let body = vec![0xabu8; 4000];
        put(&mut store, key, b"hdr!", &body);

        let (record, data) = store.get(&key).unwrap();
        assert_eq!(record.offset, 0);
        assert_eq!(data.len(), 4004);
        // The block is sized to exactly the item.
        let path = tmp.path().join(crate::cache::block::file_name(record.block_id));
        assert_eq!(fs::metadata(path).unwrap().len(), 4004);
    }

    #[test]
    fn test_uncommitted_record_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp, 1 << 20, 1024);

        let key = Key::from([2; 16]);
        let res = store.add(key, None, Bytes::new(), 4, 4).unwrap();
        assert!(store.get(&key).is_none());

        store.commit(&res);
        assert!(store.get(&key).is_some());
    }

    #[test]
    fn test_stale_commit_does_not_publish_overwrite() {
        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp, 1 << 20, 1024);

        let key = Key::from([3; 16]);
        let stale = store.add(key, None, Bytes::new(), 4, 0).unwrap();
        // A second add for the same key displaces the first record.
        let fresh = store.add(key, None, Bytes::new(), 8, 0).unwrap();

        store.commit(&stale);
        assert!(store.get(&key).is_none(), "stale commit must not publish");

        store.commit(&fresh);
        let (record, _) = store.get(&key).unwrap();
        assert_eq!(record.head_len, 8);
    }

    #[test]
    fn test_abort_removes_only_its_own_record() {
        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp, 1 << 20, 1024);

        let key = Key::from([6; 16]);
        let stale = store.add(key, None, Bytes::new(), 4, 0).unwrap();
        // A newer add for the same key displaces the stale record.
        let fresh = store.add(key, None, Bytes::new(), 8, 0).unwrap();

        assert!(
            !store.abort(&stale),
            "a stale abort must not remove the newer record"
        );
        store.commit(&fresh);
        assert!(store.get(&key).is_some());

        let replaced = store.add(key, None, Bytes::new(), 2, 0).unwrap();
        assert!(store.abort(&replaced));
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_rollback_after_short_fill() {
        let tmp = TempDir::new().unwrap();
        let mut store = open_store(&tmp, 1 << 20, 1024);

        let key = Key::from([4; 16]);
        let _res = store.add(key, None, Bytes::new(), 4, 100).unwrap();
        // Simulated short read: the protocol layer rolls the item back.
        assert!(store.delete(&key));
        assert!(store.get(&key).is_none());
    }
}
