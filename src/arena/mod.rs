//! # Chunk Arena
//!
//! A file-backed heap of small fixed-size chunks shared by every process
//! that opens the storage root. Chunks are addressed by [`ChunkHandle`], a
//! byte offset into the arena file; offsets stay valid across processes and
//! across remaps, unlike pointers.
//!
//! ## File Layout
//!
//! ```text
//! Offset  Size     Field
//! 0       4        magic (0x00d0bed0)
//! 4       4        alignment (4)
//! 8       4        size class count (64)
//! 12      4        reserved
//! 16      4 * 64   free-list head per size class
//! 272     ...      chunks, in allocation order
//! ```
//!
//! ## Size Classes
//!
//! Requests are rounded up to the 4-byte alignment; a zero-byte request is
//! treated as 4. Class `c` serves chunks of `(c + 1) * 4` bytes, from 4 up to
//! 256. There is no splitting and no coalescing: a chunk keeps its class for
//! the life of the file, which is why `free` must be told the original size.
//!
//! ```text
//! free list for class 2 (12-byte chunks):
//!
//!   head[2] ──> 0x1a4 ──> 0x0f0 ──> 0
//!               [next]    [next]
//! ```
//!
//! A free chunk stores the handle of the next free chunk of its class in its
//! first word. `allocate` pops the head (zero-filling the chunk) or, if the
//! list is empty, extends the file by one chunk. `free` pushes. Both run
//! under the arena's advisory lock; the head words are written with release
//! stores so lock-free readers of the hash chains never see a torn handle.

use std::fmt;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, error};
use zerocopy::IntoBytes;

use crate::config::{
    AccessOptions, ALLOC_ALIGNMENT, ARENA_HEADER_SIZE, ARENA_MAP_GRANULE, MAX_CHAIN_WALK,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::error::StoreError;
use crate::storage::{open_or_create, ArenaHeader, FileLock, MappedFile, ARENA_FIXED_HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle(u32);

impl ChunkHandle {
    pub const NULL: ChunkHandle = ChunkHandle(0);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn offset(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Rounds `size` to its chunk size and returns `(class, chunk_size)`.
pub fn size_class(size: usize) -> Result<(usize, usize)> {
    let rounded = size.max(MIN_CHUNK_SIZE).next_multiple_of(ALLOC_ALIGNMENT);
    if rounded > MAX_CHUNK_SIZE {
        bail!(StoreError::ChunkTooLarge {
            requested: size,
            max: MAX_CHUNK_SIZE,
        });
    }
    Ok((rounded / ALLOC_ALIGNMENT - 1, rounded))
}

fn head_offset(class: usize) -> u64 {
    (ARENA_FIXED_HEADER_SIZE + 4 * class) as u64
}

#[derive(Debug)]
pub struct Arena {
    map: MappedFile,
    access: AccessOptions,
}

impl Arena {
    pub fn open(path: &Path, access: AccessOptions) -> Result<Self> {
        let mut initial = vec![0u8; ARENA_HEADER_SIZE];
        initial[..ARENA_FIXED_HEADER_SIZE].copy_from_slice(ArenaHeader::new().as_bytes());

        let file = open_or_create(path, &initial, access.read_only)?;
        let mut map = MappedFile::new(path, file, !access.read_only, ARENA_MAP_GRANULE)?;

        ensure!(
            map.len() >= ARENA_HEADER_SIZE as u64,
            "arena '{}' is truncated ({} bytes)",
            path.display(),
            map.len()
        );
        ArenaHeader::from_bytes(map.bytes(0, ARENA_FIXED_HEADER_SIZE)?)
            .wrap_err_with(|| format!("'{}' is not a chunk arena", path.display()))?;

        Ok(Self { map, access })
    }

    pub fn path(&self) -> &Path {
        self.map.path()
    }

    /// Current size of the arena file in bytes.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() <= ARENA_HEADER_SIZE as u64
    }

    pub fn allocate(&mut self, size: usize) -> Result<ChunkHandle> {
        let (class, chunk_size) = size_class(size)?;
        self.ensure_writable()?;

        let _lock = FileLock::acquire(self.map.file(), &self.path_buf(), &self.access.lock)?;
        self.map.refresh()?;

        let head = ChunkHandle(self.map.load_u32(head_offset(class))?);
        if !head.is_null() {
            self.check_handle(head, chunk_size)?;
            let next = self.map.load_u32(head.offset())?;
            self.map.store_u32(head_offset(class), next)?;
            self.map.bytes_mut(head.offset(), chunk_size)?.fill(0);
            return Ok(head);
        }

        let end = self.map.extend_zeroed(chunk_size as u64)?;
        ensure!(
            end % ALLOC_ALIGNMENT as u64 == 0,
            "arena '{}' end {} is not aligned",
            self.path().display(),
            end
        );
        let raw = u32::try_from(end)
            .wrap_err_with(|| format!("arena '{}' exceeds 4 GiB", self.path().display()))?;
        debug!(handle = raw, size = chunk_size, "extended arena");
        Ok(ChunkHandle(raw))
    }

    /// Returns a chunk to its class. `size` must be the size it was
    /// allocated with; the arena keeps no per-chunk size.
    pub fn free(&mut self, handle: ChunkHandle, size: usize) -> Result<()> {
        let (class, chunk_size) = size_class(size)?;
        self.ensure_writable()?;

        let _lock = FileLock::acquire(self.map.file(), &self.path_buf(), &self.access.lock)?;
        self.check_handle(handle, chunk_size)?;

        let head = self.map.load_u32(head_offset(class))?;
        self.map.store_u32(handle.offset(), head)?;
        self.map.store_u32(head_offset(class), handle.0)?;
        Ok(())
    }

    /// Borrows `len` bytes of a chunk. The file is remapped first if the
    /// chunk lies beyond what this process has mapped so far.
    pub fn chunk(&mut self, handle: ChunkHandle, len: usize) -> Result<&[u8]> {
        self.check_handle(handle, len)?;
        self.map.bytes(handle.offset(), len)
    }

    /// Borrows up to `max_len` bytes from the start of a chunk whose size
    /// the caller does not know, stopping early at end of file.
    pub fn chunk_prefix(&mut self, handle: ChunkHandle, max_len: usize) -> Result<&[u8]> {
        self.check_handle(handle, MIN_CHUNK_SIZE)?;
        if handle.offset() + max_len as u64 > self.map.len() {
            self.map.refresh()?;
        }
        let available = (self.map.len() - handle.offset()).min(max_len as u64) as usize;
        self.map.bytes(handle.offset(), available)
    }

    pub fn chunk_mut(&mut self, handle: ChunkHandle, len: usize) -> Result<&mut [u8]> {
        self.ensure_writable()?;
        self.check_handle(handle, len)?;
        self.map.bytes_mut(handle.offset(), len)
    }

    pub fn load_word(&mut self, handle: ChunkHandle, offset: usize) -> Result<u32> {
        self.check_handle(handle, offset + 4)?;
        self.map.load_u32(handle.offset() + offset as u64)
    }

    pub fn store_word(&mut self, handle: ChunkHandle, offset: usize, value: u32) -> Result<()> {
        self.ensure_writable()?;
        self.check_handle(handle, offset + 4)?;
        self.map.store_u32(handle.offset() + offset as u64, value)
    }

    /// Length of one class's free list. Walks without the lock, so the
    /// answer is only a snapshot.
    pub fn free_list_len(&mut self, size: usize) -> Result<usize> {
        let (class, chunk_size) = size_class(size)?;
        let mut handle = ChunkHandle(self.map.load_u32(head_offset(class))?);
        let mut count = 0;

        while !handle.is_null() {
            if count >= MAX_CHAIN_WALK {
                error!(path = %self.path().display(), class, "free list does not terminate");
                bail!(StoreError::corrupt(
                    self.path(),
                    format!("free list for {}-byte chunks loops", chunk_size)
                ));
            }
            self.check_handle(handle, chunk_size)?;
            handle = ChunkHandle(self.map.load_u32(handle.offset())?);
            count += 1;
        }
        Ok(count)
    }

    pub fn sync(&self) -> Result<()> {
        self.map.sync()
    }

    fn check_handle(&mut self, handle: ChunkHandle, len: usize) -> Result<()> {
        let valid = !handle.is_null()
            && handle.offset() >= ARENA_HEADER_SIZE as u64
            && handle.offset() % ALLOC_ALIGNMENT as u64 == 0
            && self.map.covers(handle.offset(), len)?;
        if !valid {
            error!(path = %self.path().display(), %handle, len, "invalid chunk handle");
            bail!(StoreError::corrupt(
                self.path(),
                format!("chunk handle {} (+{} bytes) is out of bounds", handle, len)
            ));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.access.read_only {
            bail!(StoreError::ReadOnly {
                path: self.path_buf()
            });
        }
        Ok(())
    }

    fn path_buf(&self) -> PathBuf {
        self.map.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> Arena {
        Arena::open(&dir.join(".chain"), AccessOptions::default()).unwrap()
    }

    #[test]
    fn fresh_allocations_extend_the_file() {
        let dir = tempdir().unwrap();
        let mut arena = open(dir.path());

        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(10).unwrap();

        assert_eq!(a.get() as usize, ARENA_HEADER_SIZE);
        assert_eq!(b.get(), a.get() + 12);
        assert_eq!(arena.len(), (ARENA_HEADER_SIZE + 24) as u64);
    }

    #[test]
    fn freed_chunks_are_reused_lifo_and_zeroed() {
        let dir = tempdir().unwrap();
        let mut arena = open(dir.path());

        let a = arena.allocate(16).unwrap();
        let b = arena.allocate(16).unwrap();
        arena.chunk_mut(a, 16).unwrap().fill(0xaa);
        arena.chunk_mut(b, 16).unwrap().fill(0xbb);

        arena.free(a, 16).unwrap();
        arena.free(b, 16).unwrap();
        assert_eq!(arena.free_list_len(16).unwrap(), 2);

        let first = arena.allocate(13).unwrap();
        let second = arena.allocate(16).unwrap();

        assert_eq!(first, b);
        assert_eq!(second, a);
        assert_eq!(arena.chunk(first, 16).unwrap(), &[0u8; 16]);
        assert_eq!(arena.chunk(second, 16).unwrap(), &[0u8; 16]);
        assert_eq!(arena.free_list_len(16).unwrap(), 0);
    }

    #[test]
    fn classes_do_not_share_chunks() {
        let dir = tempdir().unwrap();
        let mut arena = open(dir.path());

        let small = arena.allocate(8).unwrap();
        arena.free(small, 8).unwrap();
        let bigger = arena.allocate(12).unwrap();

        assert_ne!(bigger, small);
        assert_eq!(arena.free_list_len(8).unwrap(), 1);
    }

    #[test]
    fn size_rounding() {
        assert_eq!(size_class(0).unwrap(), (0, 4));
        assert_eq!(size_class(1).unwrap(), (0, 4));
        assert_eq!(size_class(5).unwrap(), (1, 8));
        assert_eq!(size_class(256).unwrap(), (63, 256));

        let err = size_class(257).unwrap_err();
        assert_eq!(
            StoreError::of(&err),
            Some(&StoreError::ChunkTooLarge {
                requested: 257,
                max: 256
            })
        );
    }

    #[test]
    fn free_lists_survive_reopen() {
        let dir = tempdir().unwrap();
        let chunk = {
            let mut arena = open(dir.path());
            let chunk = arena.allocate(40).unwrap();
            arena.free(chunk, 40).unwrap();
            chunk
        };

        let mut arena = open(dir.path());
        assert_eq!(arena.allocate(40).unwrap(), chunk);
    }

    #[test]
    fn two_handles_share_one_heap() {
        let dir = tempdir().unwrap();
        let mut first = open(dir.path());
        let mut second = open(dir.path());

        let a = first.allocate(100).unwrap();
        let b = second.allocate(100).unwrap();
        assert_ne!(a, b);

        second.chunk_mut(b, 4).unwrap().copy_from_slice(b"ping");
        assert_eq!(first.chunk(b, 4).unwrap(), b"ping");

        first.free(a, 100).unwrap();
        assert_eq!(second.allocate(100).unwrap(), a);
    }

    #[test]
    fn null_and_unaligned_handles_are_rejected() {
        let dir = tempdir().unwrap();
        let mut arena = open(dir.path());
        let chunk = arena.allocate(8).unwrap();

        assert!(arena.chunk(ChunkHandle::NULL, 4).is_err());
        assert!(arena.chunk(ChunkHandle::new(chunk.get() + 2), 4).is_err());
        assert!(arena.chunk(ChunkHandle::new(4), 4).is_err());
        assert!(arena.chunk(chunk, 4096).is_err());
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".chain");
        std::fs::write(&path, vec![0x55u8; ARENA_HEADER_SIZE]).unwrap();

        assert!(Arena::open(&path, AccessOptions::default()).is_err());
    }

    #[test]
    fn read_only_arena_refuses_allocation() {
        let dir = tempdir().unwrap();
        drop(open(dir.path()));

        let access = AccessOptions {
            read_only: true,
            ..AccessOptions::default()
        };
        let mut arena = Arena::open(&dir.path().join(".chain"), access).unwrap();

        let err = arena.allocate(4).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::ReadOnly { .. })
        ));
    }
}
