//! # Spool Configuration Constants
//!
//! Constants are grouped by the on-disk format they belong to. Several of
//! them are load-bearing for compatibility between processes sharing a
//! storage root: changing a magic number, the arena alignment or the size
//! class bounds makes existing files unreadable.
//!
//! ## Dependency Graph
//!
//! ```text
//! ALLOC_ALIGNMENT (4)
//!       │
//!       ├─> MIN_CHUNK_SIZE / MAX_CHUNK_SIZE (multiples of the alignment)
//!       │
//!       ├─> SIZE_CLASS_COUNT (derived: one class per multiple)
//!       │
//!       └─> ARENA_HEADER_SIZE (must stay a multiple of the alignment so the
//!             first chunk handle is aligned for atomic word access)
//!
//! MAX_CHUNK_SIZE (256)
//!       │
//!       └─> MAX_MESSAGE_ID_LEN (derived: chain node header + NUL must fit)
//!
//! DEFAULT_ARTICLES_PER_FILE (10)
//!       │
//!       └─> expiry granularity: whole article files are expired at once
//! ```

use std::time::Duration;

// ============================================================================
// FILE NAMES
// Relative to the storage root (or to a group directory for per-group files)
// ============================================================================

pub const ARENA_FILE_NAME: &str = ".chain";
pub const TABLE_FILE_NAME: &str = ".table";
pub const GROUP_FILE_NAME: &str = ".newsgroup";
pub const TIMES_FILE_NAME: &str = ".times";
pub const TIMES_TMP_FILE_NAME: &str = ".times.tmp";

/// Prefix of the scratch file a compaction pass writes before renaming it
/// over the original article file.
pub const COMPACT_PREFIX: char = '+';

// ============================================================================
// CHUNK ALLOCATOR
// ============================================================================

pub const ARENA_MAGIC: u32 = 0x00d0_bed0;

/// Allocation granularity; every chunk handle is a multiple of this.
pub const ALLOC_ALIGNMENT: usize = 4;

pub const MIN_CHUNK_SIZE: usize = ALLOC_ALIGNMENT;

/// Largest request the arena serves. Bigger requests are refused rather
/// than split across chunks.
pub const MAX_CHUNK_SIZE: usize = 256;

pub const SIZE_CLASS_COUNT: usize = (MAX_CHUNK_SIZE - MIN_CHUNK_SIZE) / ALLOC_ALIGNMENT + 1;

/// magic, alignment, class count, reserved, then one free-list head per class.
pub const ARENA_HEADER_SIZE: usize = 16 + 4 * SIZE_CLASS_COUNT;

/// The arena mapping is grown in steps of this many bytes past the end of
/// the file, so a run of small extensions does not remap every time.
pub const ARENA_MAP_GRANULE: usize = 64 * 1024;

const _: () = assert!(MIN_CHUNK_SIZE % ALLOC_ALIGNMENT == 0);
const _: () = assert!(MAX_CHUNK_SIZE % ALLOC_ALIGNMENT == 0);
const _: () = assert!(ALLOC_ALIGNMENT >= 4, "free-list links are 4-byte words");
const _: () = assert!(
    ARENA_HEADER_SIZE % ALLOC_ALIGNMENT == 0,
    "first chunk must be aligned"
);

// ============================================================================
// DISK HASH INDEX
// ============================================================================

pub const TABLE_MAGIC: u32 = 0x0d0b_ed00;

pub const TABLE_HEADER_SIZE: usize = 16;

/// Buckets in a freshly created table. Fixed for the life of the table.
pub const DEFAULT_HASH_BUCKETS: u32 = 10240;

pub const MAX_HASH_BUCKETS: u32 = 1 << 24;

/// serial (4) + next (4) + newsgroup id (2)
pub const CHAIN_NODE_HEADER_SIZE: usize = 10;

pub const MAX_MESSAGE_ID_LEN: usize = MAX_CHUNK_SIZE - CHAIN_NODE_HEADER_SIZE - 1;

/// Upper bound on nodes visited in one chain walk; hitting it means the
/// chain loops.
pub const MAX_CHAIN_WALK: usize = 1 << 20;

const _: () = assert!(CHAIN_NODE_HEADER_SIZE + 2 <= MAX_CHUNK_SIZE);

// ============================================================================
// NEWSGROUP TABLE
// ============================================================================

pub const FIRST_GROUP_ID: u32 = 1;

/// Group ids are stored in two bytes inside chain nodes.
pub const MAX_GROUP_ID: u32 = u16::MAX as u32;

pub const MAX_GROUP_NAME_LEN: usize = 255;

// ============================================================================
// ARTICLE FILES
// ============================================================================

pub const ARTICLE_MAGIC: u32 = 0x000f_ace0;

pub const ARTICLE_HEADER_SIZE: usize = 8;

/// head offset, head length, body offset, body length
pub const SLOT_SIZE: usize = 16;

/// Both offsets of a cancelled slot hold this value.
pub const SLOT_TOMBSTONE: u32 = u32::MAX;

pub const DEFAULT_ARTICLES_PER_FILE: u32 = 10;

/// One slot per file would make every store a compaction.
pub const MIN_ARTICLES_PER_FILE: u32 = 2;

pub const MAX_ARTICLES_PER_FILE: u32 = 4096;

/// Growth step for article file mappings.
pub const ARTICLE_MAP_GRANULE: usize = 16 * 1024;

/// Alias redirects followed by one fetch before giving up.
pub const MAX_ALIAS_HOPS: usize = 10;

/// Head of an alias record; the rest of the line is `group:serial<id>`.
pub const ALIAS_PREFIX: &[u8] = b"Message-ID:";

// ============================================================================
// TEMPORAL INDEX
// ============================================================================

/// serial (4) + stored-at seconds (8)
pub const TIMES_RECORD_SIZE: usize = 12;

pub const TIMES_MAP_GRANULE: usize = 4096;

// ============================================================================
// CACHES
// ============================================================================

pub const MIN_CACHE_CAPACITY: usize = 2;

/// Read-only article file mappings kept open for fetches.
pub const ARTICLE_CACHE_CAPACITY: usize = 8;

/// Writable article files kept open for stores and cancels.
pub const STORE_CACHE_CAPACITY: usize = 8;

/// Open `.times` logs.
pub const TIMES_CACHE_CAPACITY: usize = 3;

// ============================================================================
// ADVISORY LOCKING
// ============================================================================

pub const DEFAULT_LOCK_ATTEMPTS: u32 = 100;

pub const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(2);

pub const MAX_LOCK_BACKOFF: Duration = Duration::from_millis(50);

