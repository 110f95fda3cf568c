//! # On-Disk Record Definitions
//!
//! Zerocopy structs for every fixed-layout record the spool writes. Each one
//! is `#[repr(C)]`, built only from byte arrays and little-endian integer
//! wrappers, and therefore `Unaligned`: it can be read straight out of a
//! mapping at any offset with `ref_from_bytes` and written with `as_bytes`.
//!
//! | Record              | File                   | Size                  |
//! |---------------------|------------------------|-----------------------|
//! | `ArenaHeader`       | `.chain`               | 16 (+ free-list heads)|
//! | `TableHeader`       | `.table`               | 16 (+ bucket heads)   |
//! | `ArticleFileHeader` | `<group>/<n>`          | 8                     |
//! | `Slot`              | `<group>/<n>`          | 16 per slot           |
//! | `TimesRecord`       | `<group>/.times`       | 12 per record         |
//!
//! The variable-length arrays that follow the arena and table headers are
//! word arrays accessed atomically through `MappedFile::load_u32` and
//! `store_u32`, not through these structs.
//!
//! ## Slot States
//!
//! ```text
//! head_off == 0                         -> Empty (never written or still in flight)
//! head_off == body_off == TOMBSTONE     -> Cancelled
//! offsets real, both lengths >= 2       -> Valid
//! anything else                         -> Corrupt
//! ```
//!
//! A store publishes the head offset last, so a reader that sees a non-zero
//! head offset also sees the lengths and body offset.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    ALLOC_ALIGNMENT, ARENA_MAGIC, ARTICLE_HEADER_SIZE, ARTICLE_MAGIC, SIZE_CLASS_COUNT,
    SLOT_SIZE, SLOT_TOMBSTONE, TABLE_HEADER_SIZE, TABLE_MAGIC, TIMES_RECORD_SIZE,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArenaHeader {
    magic: U32,
    alignment: U32,
    class_count: U32,
    reserved: U32,
}

pub const ARENA_FIXED_HEADER_SIZE: usize = 16;

const _: () = assert!(std::mem::size_of::<ArenaHeader>() == ARENA_FIXED_HEADER_SIZE);

impl ArenaHeader {
    pub fn new() -> Self {
        Self {
            magic: U32::new(ARENA_MAGIC),
            alignment: U32::new(ALLOC_ALIGNMENT as u32),
            class_count: U32::new(SIZE_CLASS_COUNT as u32),
            reserved: U32::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= ARENA_FIXED_HEADER_SIZE,
            "buffer too small for ArenaHeader: {} < {}",
            bytes.len(),
            ARENA_FIXED_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..ARENA_FIXED_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ArenaHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == ARENA_MAGIC,
            "invalid arena magic {:#010x}",
            header.magic.get()
        );
        ensure!(
            header.alignment.get() as usize == ALLOC_ALIGNMENT,
            "arena alignment {} does not match {}",
            header.alignment.get(),
            ALLOC_ALIGNMENT
        );
        ensure!(
            header.class_count.get() as usize == SIZE_CLASS_COUNT,
            "arena has {} size classes, expected {}",
            header.class_count.get(),
            SIZE_CLASS_COUNT
        );

        Ok(header)
    }
}

impl Default for ArenaHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TableHeader {
    magic: U32,
    bucket_count: U32,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<TableHeader>() == TABLE_HEADER_SIZE);

impl TableHeader {
    pub fn new(bucket_count: u32) -> Self {
        Self {
            magic: U32::new(TABLE_MAGIC),
            bucket_count: U32::new(bucket_count),
            reserved: [0u8; 8],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= TABLE_HEADER_SIZE,
            "buffer too small for TableHeader: {} < {}",
            bytes.len(),
            TABLE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..TABLE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse TableHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == TABLE_MAGIC,
            "invalid hash table magic {:#010x}",
            header.magic.get()
        );
        ensure!(header.bucket_count.get() > 0, "hash table has no buckets");

        Ok(header)
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ArticleFileHeader {
    magic: U32,
    slot_count: U32,
}

const _: () = assert!(std::mem::size_of::<ArticleFileHeader>() == ARTICLE_HEADER_SIZE);

impl ArticleFileHeader {
    pub fn new(slot_count: u32) -> Self {
        Self {
            magic: U32::new(ARTICLE_MAGIC),
            slot_count: U32::new(slot_count),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= ARTICLE_HEADER_SIZE,
            "buffer too small for ArticleFileHeader: {} < {}",
            bytes.len(),
            ARTICLE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..ARTICLE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ArticleFileHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == ARTICLE_MAGIC,
            "invalid article file magic {:#010x}",
            header.magic.get()
        );

        Ok(header)
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count.get()
    }

    /// Bytes before the first article: this header plus the slot table.
    pub fn data_start(slot_count: u32) -> u64 {
        (ARTICLE_HEADER_SIZE + SLOT_SIZE * slot_count as usize) as u64
    }

    pub fn slot_offset(index: u32) -> u64 {
        (ARTICLE_HEADER_SIZE + SLOT_SIZE * index as usize) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Valid,
    Cancelled,
    Corrupt,
}

#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct Slot {
    head_off: U32,
    head_len: U32,
    body_off: U32,
    body_len: U32,
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    pub const HEAD_OFF: u64 = 0;
    pub const HEAD_LEN: u64 = 4;
    pub const BODY_OFF: u64 = 8;
    pub const BODY_LEN: u64 = 12;

    pub fn new(head_off: u32, head_len: u32, body_off: u32, body_len: u32) -> Self {
        Self {
            head_off: U32::new(head_off),
            head_len: U32::new(head_len),
            body_off: U32::new(body_off),
            body_len: U32::new(body_len),
        }
    }

    pub fn cancelled(head_len: u32, body_len: u32) -> Self {
        Self::new(SLOT_TOMBSTONE, head_len, SLOT_TOMBSTONE, body_len)
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= SLOT_SIZE,
            "buffer too small for Slot: {} < {}",
            bytes.len(),
            SLOT_SIZE
        );
        Self::read_from_bytes(&bytes[..SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse Slot: {:?}", e))
    }

    pub fn head_off(&self) -> u32 {
        self.head_off.get()
    }

    pub fn head_len(&self) -> u32 {
        self.head_len.get()
    }

    pub fn body_off(&self) -> u32 {
        self.body_off.get()
    }

    pub fn body_len(&self) -> u32 {
        self.body_len.get()
    }

    /// One past the last byte this slot refers to.
    pub fn end(&self) -> u64 {
        let head_end = self.head_off() as u64 + self.head_len() as u64;
        let body_end = self.body_off() as u64 + self.body_len() as u64;
        head_end.max(body_end)
    }

    pub fn state(&self) -> SlotState {
        let (head, body) = (self.head_off(), self.body_off());
        if head == 0 {
            return SlotState::Empty;
        }
        if head == SLOT_TOMBSTONE && body == SLOT_TOMBSTONE {
            return SlotState::Cancelled;
        }
        let real = |off: u32| off != 0 && off != SLOT_TOMBSTONE;
        if real(head) && real(body) && self.head_len() >= 2 && self.body_len() >= 2 {
            SlotState::Valid
        } else {
            SlotState::Corrupt
        }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct TimesRecord {
    serial: U32,
    stored_at: U64,
}

const _: () = assert!(std::mem::size_of::<TimesRecord>() == TIMES_RECORD_SIZE);

impl TimesRecord {
    pub fn new(serial: u32, stored_at: u64) -> Self {
        Self {
            serial: U32::new(serial),
            stored_at: U64::new(stored_at),
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial.get()
    }

    pub fn stored_at(&self) -> u64 {
        self.stored_at.get()
    }

    /// Views a packed run of records. Trailing bytes that do not make up a
    /// whole record (an append still in progress) are ignored.
    pub fn slice_from_bytes(bytes: &[u8]) -> Result<&[Self]> {
        let whole = bytes.len() - bytes.len() % TIMES_RECORD_SIZE;
        <[Self]>::ref_from_bytes(&bytes[..whole])
            .map_err(|e| eyre::eyre!("failed to parse time records: {:?}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_header_round_trips_through_bytes() {
        let header = ArenaHeader::new();
        let parsed = ArenaHeader::from_bytes(header.as_bytes()).unwrap();

        assert_eq!(parsed.as_bytes(), header.as_bytes());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = TableHeader::new(16).as_bytes().to_vec();
        bytes[0] ^= 0xff;

        assert!(TableHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn slot_states_are_classified() {
        assert_eq!(Slot::default().state(), SlotState::Empty);
        assert_eq!(Slot::new(100, 5, 105, 4).state(), SlotState::Valid);
        assert_eq!(Slot::cancelled(5, 4).state(), SlotState::Cancelled);
        assert_eq!(Slot::new(100, 5, 0, 4).state(), SlotState::Corrupt);
        assert_eq!(Slot::new(100, 0, 105, 4).state(), SlotState::Corrupt);
        assert_eq!(
            Slot::new(SLOT_TOMBSTONE, 5, 105, 4).state(),
            SlotState::Corrupt
        );
    }

    #[test]
    fn slot_field_offsets_match_layout() {
        let slot = Slot::new(1, 2, 3, 4);
        let bytes = slot.as_bytes();

        assert_eq!(bytes[Slot::HEAD_OFF as usize], 1);
        assert_eq!(bytes[Slot::HEAD_LEN as usize], 2);
        assert_eq!(bytes[Slot::BODY_OFF as usize], 3);
        assert_eq!(bytes[Slot::BODY_LEN as usize], 4);
        assert_eq!(slot.end(), 7);
    }

    #[test]
    fn partial_time_record_is_ignored() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(TimesRecord::new(7, 1000).as_bytes());
        bytes.extend_from_slice(TimesRecord::new(8, 1001).as_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);

        let records = TimesRecord::slice_from_bytes(&bytes).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].serial(), 8);
        assert_eq!(records[1].stored_at(), 1001);
    }
}
