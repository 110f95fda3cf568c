//! # Disk Hash Index
//!
//! Maps a message-ID to the `(newsgroup, serial)` where the article is
//! stored. The table is three files under the storage root:
//!
//! ```text
//! .table      bucket heads      ──┐
//!                                 │ handle
//! .chain      arena of nodes   <──┘  [serial|next|group|message-id\0] ──> ...
//!
//! .newsgroup  group id <-> name
//! ```
//!
//! ## Table File
//!
//! ```text
//! Offset  Size  Field
//! 0       4     magic (0x0d0bed00)
//! 4       4     bucket count N
//! 8       8     reserved
//! 16      4*N   bucket heads (arena handles, 0 = empty)
//! ```
//!
//! The bucket count is fixed when the table is created; reopening with a
//! different requested count keeps the stored one.
//!
//! ## Hashing
//!
//! DJB's rolling hash over the message-ID bytes, reduced modulo N:
//!
//! ```text
//! h = 5381
//! for each byte b: h = h + (h << 5); h = h ^ b      (wrapping u32)
//! ```
//!
//! ## Concurrency
//!
//! `find` never locks. `insert` and `delete` serialize on the table file's
//! advisory lock. An insert writes the complete node, including its `next`
//! link to the current head, before publishing the node's handle into the
//! bucket with one release store; a concurrent reader sees either the old
//! chain or the new one.
//!
//! Two processes can still race to insert the same message-ID if one
//! searches before the other publishes. Both inserts then succeed and the
//! chain holds two nodes; lookups return the newer one and deleting removes
//! one at a time. This is tolerated rather than prevented.
//!
//! A delete tombstones the node (first message-ID byte set to NUL) before
//! unlinking it, so a reader already standing on the node stops matching it
//! but can still follow its `next` link.

mod chain;

use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{error, warn};
use zerocopy::IntoBytes;

use crate::arena::{Arena, ChunkHandle};
use crate::config::{
    AccessOptions, ARENA_FILE_NAME, ARENA_MAP_GRANULE, CHAIN_NODE_HEADER_SIZE, GROUP_FILE_NAME,
    MAX_CHAIN_WALK, MAX_CHUNK_SIZE, MAX_HASH_BUCKETS, TABLE_FILE_NAME, TABLE_HEADER_SIZE,
};
use crate::error::StoreError;
use crate::newsgroup::{GroupId, GroupTable};
use crate::storage::{open_or_create, FileLock, MappedFile, TableHeader};

pub use chain::is_indexable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub group: String,
    pub serial: u32,
}

pub fn djb_hash(key: &[u8]) -> u32 {
    key.iter().fold(5381u32, |h, &b| h.wrapping_add(h << 5) ^ b as u32)
}

#[derive(Debug, Clone, Copy)]
struct Located {
    handle: ChunkHandle,
    prev: Option<ChunkHandle>,
    serial: u32,
    group: GroupId,
}

#[derive(Debug)]
pub struct DiskHash {
    table: MappedFile,
    buckets: u32,
    arena: Arena,
    groups: GroupTable,
    access: AccessOptions,
}

impl DiskHash {
    pub fn open(root: &Path, bucket_count: u32, access: AccessOptions) -> Result<Self> {
        ensure!(
            (1..=MAX_HASH_BUCKETS).contains(&bucket_count),
            "bucket count {} out of range",
            bucket_count
        );

        let path = root.join(TABLE_FILE_NAME);
        let mut initial = vec![0u8; TABLE_HEADER_SIZE + 4 * bucket_count as usize];
        initial[..TABLE_HEADER_SIZE].copy_from_slice(TableHeader::new(bucket_count).as_bytes());

        let file = open_or_create(&path, &initial, access.read_only)?;
        let mut table = MappedFile::new(&path, file, !access.read_only, ARENA_MAP_GRANULE)?;

        let buckets = TableHeader::from_bytes(table.bytes(0, TABLE_HEADER_SIZE)?)
            .wrap_err_with(|| format!("'{}' is not a hash table", path.display()))?
            .bucket_count();
        if buckets != bucket_count {
            warn!(
                path = %path.display(),
                stored = buckets,
                requested = bucket_count,
                "keeping bucket count of existing table"
            );
        }
        ensure!(
            table.len() >= TABLE_HEADER_SIZE as u64 + 4 * buckets as u64,
            "hash table '{}' is truncated",
            path.display()
        );

        let arena = Arena::open(&root.join(ARENA_FILE_NAME), access)?;
        let groups = GroupTable::open(&root.join(GROUP_FILE_NAME), access)?;

        Ok(Self {
            table,
            buckets,
            arena,
            groups,
            access,
        })
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets
    }

    pub fn groups(&mut self) -> &mut GroupTable {
        &mut self.groups
    }

    pub fn arena(&mut self) -> &mut Arena {
        &mut self.arena
    }

    fn bucket_index(&self, message_id: &[u8]) -> u32 {
        djb_hash(message_id) % self.buckets
    }

    fn bucket_offset(&self, message_id: &[u8]) -> u64 {
        TABLE_HEADER_SIZE as u64 + 4 * self.bucket_index(message_id) as u64
    }

    pub fn insert(&mut self, message_id: &str, group: &str, serial: u32) -> Result<()> {
        let key = message_id.as_bytes();
        self.ensure_writable()?;
        ensure!(
            chain::is_indexable(key),
            "message-id {:?} cannot be indexed",
            message_id
        );

        let group_id = self.groups.intern(group)?;

        let _lock = FileLock::acquire(self.table.file(), self.table.path(), &self.access.lock)?;
        if self.locate(key)?.is_some() {
            bail!(StoreError::Duplicate {
                message_id: message_id.to_string()
            });
        }

        let bucket = self.bucket_offset(key);
        let size = chain::node_size(key.len());
        let handle = self.arena.allocate(size)?;
        let head = ChunkHandle::new(self.table.load_u32(bucket)?);

        let node = chain::encode(serial, head, group_id, key);
        self.arena.chunk_mut(handle, size)?.copy_from_slice(&node);
        self.table.store_u32(bucket, handle.get())?;
        Ok(())
    }

    pub fn find(&mut self, message_id: &str) -> Result<IndexEntry> {
        let key = message_id.as_bytes();
        let located = if chain::is_indexable(key) {
            self.locate(key)?
        } else {
            None
        };
        let Some(located) = located else {
            bail!(StoreError::not_found(message_id));
        };

        let group = self.group_name(located.group)?;
        Ok(IndexEntry {
            group,
            serial: located.serial,
        })
    }

    pub fn delete(&mut self, message_id: &str) -> Result<()> {
        let key = message_id.as_bytes();
        self.ensure_writable()?;
        if !chain::is_indexable(key) {
            bail!(StoreError::not_found(message_id));
        }

        let _lock = FileLock::acquire(self.table.file(), self.table.path(), &self.access.lock)?;
        let Some(located) = self.locate(key)? else {
            bail!(StoreError::not_found(message_id));
        };

        let size = chain::node_size(key.len());
        self.arena.chunk_mut(located.handle, size)?[CHAIN_NODE_HEADER_SIZE] = 0;

        let next = self.arena.load_word(located.handle, chain::NEXT_OFFSET)?;
        match located.prev {
            Some(prev) => self.arena.store_word(prev, chain::NEXT_OFFSET, next)?,
            None => {
                let bucket = self.bucket_offset(key);
                self.table.store_u32(bucket, next)?;
            }
        }

        self.arena.free(located.handle, size)
    }

    /// Every live entry, bucket by bucket. Takes no lock.
    pub fn entries(&mut self) -> Result<Vec<(String, IndexEntry)>> {
        let mut out = Vec::new();

        for bucket in 0..self.buckets {
            let offset = TABLE_HEADER_SIZE as u64 + 4 * bucket as u64;
            let mut handle = ChunkHandle::new(self.table.load_u32(offset)?);
            let mut steps = 0;

            while !handle.is_null() {
                steps += 1;
                self.check_walk(steps, bucket)?;

                let (message_id, serial, group) = {
                    let node = self.node(handle)?;
                    (
                        String::from_utf8_lossy(node.message_id).into_owned(),
                        node.serial,
                        node.group,
                    )
                };
                if !message_id.is_empty() {
                    let group = self.group_name(group)?;
                    out.push((message_id, IndexEntry { group, serial }));
                }
                handle = ChunkHandle::new(self.arena.load_word(handle, chain::NEXT_OFFSET)?);
            }
        }
        Ok(out)
    }

    pub fn sync(&self) -> Result<()> {
        self.table.sync()?;
        self.arena.sync()
    }

    fn locate(&mut self, key: &[u8]) -> Result<Option<Located>> {
        let bucket = self.bucket_offset(key);
        let mut handle = ChunkHandle::new(self.table.load_u32(bucket)?);
        let mut prev = None;
        let mut steps = 0;

        while !handle.is_null() {
            steps += 1;
            self.check_walk(steps, self.bucket_index(key))?;

            let (hit, serial, group) = {
                let node = self.node(handle)?;
                (node.message_id == key, node.serial, node.group)
            };
            if hit {
                return Ok(Some(Located {
                    handle,
                    prev,
                    serial,
                    group,
                }));
            }
            prev = Some(handle);
            handle = ChunkHandle::new(self.arena.load_word(handle, chain::NEXT_OFFSET)?);
        }
        Ok(None)
    }

    fn node(&mut self, handle: ChunkHandle) -> Result<chain::NodeRef<'_>> {
        let path = self.arena.path().to_path_buf();
        let bytes = self.arena.chunk_prefix(handle, MAX_CHUNK_SIZE)?;
        match chain::parse(bytes) {
            Some(node) => Ok(node),
            None => {
                error!(path = %path.display(), %handle, "malformed chain node");
                bail!(StoreError::corrupt(
                    path,
                    format!("chain node {} is malformed", handle)
                ))
            }
        }
    }

    fn check_walk(&self, steps: usize, bucket: u32) -> Result<()> {
        if steps > MAX_CHAIN_WALK {
            error!(path = %self.table.path().display(), bucket, "hash chain does not terminate");
            bail!(StoreError::corrupt(
                self.table.path(),
                format!("chain in bucket {} loops", bucket)
            ));
        }
        Ok(())
    }

    fn group_name(&mut self, id: GroupId) -> Result<String> {
        match self.groups.name(id)? {
            Some(name) => Ok(name.to_string()),
            None => {
                error!(id = id.get(), "index refers to unknown newsgroup id");
                bail!(StoreError::corrupt(
                    self.groups.path(),
                    format!("newsgroup id {} is not interned", id.get())
                ))
            }
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.access.read_only {
            bail!(StoreError::ReadOnly {
                path: self.table.path().to_path_buf()
            });
        }
        Ok(())
    }
}
