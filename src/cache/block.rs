//! Memory-mapped storage blocks.
//!
//! A [`Block`] is a contiguous file-backed region obtained with mmap; it is
//! the unit of allocation and of eviction. Items are appended sequentially
//! and never moved; reclaiming space means dropping a whole block.
//!
//! Blocks are shared as `Arc<Block>`. A reader holds the `Arc` alive through
//! its [`ItemHandle`], so a logically evicted block is unmapped and its file
//! deleted only once the last handle is gone. This replaces a timer-based
//! grace period with reference counting: freed memory is unreachable by
//! construction.

use std::fs::{self, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error};

use crate::cache::key::Key;

/// Unique identifier for a block, monotonically increasing per store.
/// Doubles as the FIFO eviction priority: smaller id means older block.
pub type BlockId = u64;

/// File name of a block inside its tier directory.
pub fn file_name(id: BlockId) -> String {
    format!("{id:016x}.blk")
}

/// A fixed-capacity memory-mapped byte region backed by a file.
pub struct Block {
    id: BlockId,
    capacity: usize,
    path: PathBuf,
    ptr: *mut u8,
    /// Keeps the mapping alive; never accessed after construction.
    _mmap: MmapMut,
    /// Set at logical eviction; the backing file is removed on last drop.
    doomed: AtomicBool,
}

// SAFETY: Block is safe to send/share between threads because:
// 1. the mmap region is allocated once and never moves until Drop,
// 2. byte ranges are only aliased through WriteReservation (exclusive by
//    cursor construction) and ItemHandle (immutable once committed),
// 3. `doomed` is an atomic.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Create a new block file of exactly `capacity` bytes and map it.
    pub fn create(dir: &Path, id: BlockId, capacity: usize) -> io::Result<Arc<Self>> {
        if capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block capacity must be non-zero",
            ));
        }
        let path = dir.join(file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;
        Self::map(file, path, id, capacity)
    }

    /// Map an existing block file; its length is the capacity.
    pub fn open(path: PathBuf, id: BlockId) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let capacity = file.metadata()?.len() as usize;
        if capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block file {} is empty", path.display()),
            ));
        }
        Self::map(file, path, id, capacity)
    }

    fn map(file: fs::File, path: PathBuf, id: BlockId, capacity: usize) -> io::Result<Arc<Self>> {
        // SAFETY: the file stays this length for the lifetime of the map;
        // the engine never truncates a mapped block file.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        Ok(Arc::new(Self {
            id,
            capacity,
            path,
            ptr,
            _mmap: mmap,
            doomed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark this block for physical reclamation once the last reference is
    /// dropped.
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    /// Shared view of a committed range.
    ///
    /// # Safety
    ///
    /// `offset + len` must be within capacity and the range must not be
    /// concurrently written. The engine guarantees this: readable ranges are
    /// committed, and committed ranges are never rewritten in place.
    pub(crate) unsafe fn range(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.capacity, "range outside block");
        std::slice::from_raw_parts(self.ptr.add(offset), len)
    }

    /// Exclusive view of a reserved range.
    ///
    /// # Safety
    ///
    /// `offset + len` must be within capacity and the caller must hold the
    /// only access path to the range (a live [`WriteReservation`]).
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn range_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.capacity, "range outside block");
        std::slice::from_raw_parts_mut(self.ptr.add(offset), len)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.doomed.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(block_id = self.id, path = %self.path.display(), "reclaimed block file"),
                // Cannot propagate from Drop; the file is leaked.
                Err(e) => error!(
                    block_id = self.id,
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove evicted block file; leaking it"
                ),
            }
        }
        // The mapping itself is released when `_mmap` drops.
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("path", &self.path)
            .field("doomed", &self.doomed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Writable byte range reserved by an `add`.
///
/// The caller fills header bytes then body bytes into [`buf`](Self::buf) and
/// commits through the owning store. Until commit, the item is invisible to
/// readers; on a short or failed fill the caller must roll back with a
/// `delete` on the key.
pub struct WriteReservation {
    key: Key,
    block: Arc<Block>,
    offset: usize,
    len: usize,
}

impl WriteReservation {
    pub(crate) fn new(key: Key, block: Arc<Block>, offset: usize, len: usize) -> Self {
        Self {
            key,
            block,
            offset,
            len,
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn block_id(&self) -> BlockId {
        self.block.id()
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The reserved range, to be filled in place.
    pub fn buf(&mut self) -> &mut [u8] {
        // SAFETY: the cursor hands out disjoint ranges, and this reservation
        // is the only access path to its range until commit; the Arc keeps
        // the mapping alive.
        unsafe { self.block.range_mut(self.offset, self.len) }
    }
}

impl std::fmt::Debug for WriteReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteReservation")
            .field("key", &self.key)
            .field("block_id", &self.block.id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Borrowed view of a stored item's bytes (`header` then `body`).
///
/// Holding the handle keeps the backing block mapped even across eviction;
/// the block file is removed only after the last handle drops.
#[derive(Clone)]
pub struct ItemHandle {
    block: Arc<Block>,
    offset: usize,
    head_len: usize,
    body_len: usize,
}

impl ItemHandle {
    pub(crate) fn new(block: Arc<Block>, offset: usize, head_len: usize, body_len: usize) -> Self {
        Self {
            block,
            offset,
            head_len,
            body_len,
        }
    }

    /// Header segment.
    pub fn head(&self) -> &[u8] {
        &self[..self.head_len]
    }

    /// Body segment.
    pub fn body(&self) -> &[u8] {
        &self[self.head_len..]
    }

    pub fn len(&self) -> usize {
        self.head_len + self.body_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for ItemHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the range was committed before the handle was created and
        // committed ranges are never rewritten in place; the Arc keeps the
        // mapping alive.
        unsafe { self.block.range(self.offset, self.head_len + self.body_len) }
    }
}

impl std::fmt::Debug for ItemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemHandle")
            .field("block_id", &self.block.id())
            .field("offset", &self.offset)
            .field("head_len", &self.head_len)
            .field("body_len", &self.body_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_fill() {
        let tmp = TempDir::new().unwrap();
        let block = Block::create(tmp.path(), 0, 4096).unwrap();
        assert_eq!(block.capacity(), 4096);
        assert!(block.path().exists());

        let key = Key::from([7u8; 16]);
        let mut res = WriteReservation::new(key, block.clone(), 128, 16);
        res.buf().copy_from_slice(b"0123456789abcdef");

        let handle = ItemHandle::new(block, 128, 4, 12);
        assert_eq!(handle.head(), b"0123");
        assert_eq!(handle.body(), b"456789abcdef");
        assert_eq!(&handle[..], b"0123456789abcdef");
    }

    #[test]
    fn test_open_existing_uses_file_length() {
        let tmp = TempDir::new().unwrap();
        {
            let block = Block::create(tmp.path(), 3, 1024).unwrap();
            let mut res =
                WriteReservation::new(Key::from([0u8; 16]), block.clone(), 0, 5);
            res.buf().copy_from_slice(b"hello");
        }

        let path = tmp.path().join(file_name(3));
        let block = Block::open(path, 3).unwrap();
        assert_eq!(block.capacity(), 1024);
        let handle = ItemHandle::new(block, 0, 5, 0);
        assert_eq!(handle.head(), b"hello");
    }

    #[test]
    fn test_doomed_block_removes_file_on_last_drop() {
        let tmp = TempDir::new().unwrap();
        let block = Block::create(tmp.path(), 9, 512).unwrap();
        let path = block.path().to_path_buf();

        let handle = ItemHandle::new(block.clone(), 0, 8, 0);
        block.doom();
        drop(block);
        // A reader still holds the block: the file must survive.
        assert!(path.exists());
        assert_eq!(handle.len(), 8);

        drop(handle);
        assert!(!path.exists());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(Block::create(tmp.path(), 0, 0).is_err());
    }
}
