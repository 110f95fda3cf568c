//! Cached handles on article files.
//!
//! Readers and writers keep separate handles. An [`ArticleMap`] is a
//! read-only mapping used by fetches; a [`StoreFile`] is a writable handle
//! used to append articles and to flip slots. Both go stale when compaction
//! renames a new file over the path they were opened from, and the caches
//! drop them on their next lookup.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use eyre::{bail, Result, WrapErr};
use zerocopy::IntoBytes;

use crate::cache::Cacheable;
use crate::config::{ARTICLE_MAP_GRANULE, SLOT_TOMBSTONE};
use crate::error::StoreError;
use crate::storage::{create_new_atomically, ArticleFileHeader, MappedFile, Slot};

pub fn article_path(root: &Path, group: &str, number: u32) -> PathBuf {
    root.join(group).join(number.to_string())
}

/// Header plus an all-empty slot table.
pub fn empty_article_file(slots: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; ArticleFileHeader::data_start(slots) as usize];
    let header = ArticleFileHeader::new(slots);
    bytes[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
    bytes
}

/// Reads one slot. The head offset is loaded first with acquire ordering;
/// it is the word a store publishes last.
fn read_slot(map: &mut MappedFile, index: u32) -> Result<Slot> {
    let base = ArticleFileHeader::slot_offset(index);
    let head_off = map.load_u32(base + Slot::HEAD_OFF)?;
    let head_len = map.load_u32(base + Slot::HEAD_LEN)?;
    let body_off = map.load_u32(base + Slot::BODY_OFF)?;
    let body_len = map.load_u32(base + Slot::BODY_LEN)?;
    Ok(Slot::new(head_off, head_len, body_off, body_len))
}

fn check_header(map: &mut MappedFile, slots: u32) -> Result<()> {
    let path = map.path().to_path_buf();
    let found = ArticleFileHeader::from_bytes(map.bytes(0, ArticleFileHeader::data_start(0) as usize)?)
        .wrap_err_with(|| format!("'{}' is not an article file", path.display()))?
        .slot_count();
    if found != slots {
        bail!(StoreError::corrupt(
            path,
            format!("file has {} slots, expected {}", found, slots)
        ));
    }
    if !map.covers(0, ArticleFileHeader::data_start(slots) as usize)? {
        bail!(StoreError::corrupt(path, "slot table is truncated"));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ArticleMap {
    map: MappedFile,
}

impl ArticleMap {
    pub fn open(path: &Path, slots: u32) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                bail!(StoreError::not_found(path.display().to_string()))
            }
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to open '{}'", path.display()))
            }
        };
        let mut map = MappedFile::new(path, file, false, ARTICLE_MAP_GRANULE)?;
        check_header(&mut map, slots)?;
        Ok(Self { map })
    }

    pub fn path(&self) -> &Path {
        self.map.path()
    }

    pub fn slot(&mut self, index: u32) -> Result<Slot> {
        read_slot(&mut self.map, index)
    }

    /// True if every byte the slot refers to is inside the file, refreshing
    /// the mapping once if needed.
    pub fn covers(&mut self, slot: &Slot) -> Result<bool> {
        self.map.covers(0, slot.end() as usize)
    }

    /// Head and body of a valid slot, without their zero sentinels. The
    /// slot must have passed `covers`.
    pub fn article(&self, slot: &Slot) -> Result<(&[u8], &[u8])> {
        let head = self.map.get(slot.head_off() as u64, slot.head_len() as usize)?;
        let body = self.map.get(slot.body_off() as u64, slot.body_len() as usize)?;
        if head[0] != 0 || body[0] != 0 {
            bail!(StoreError::corrupt(
                self.path(),
                format!("article at offset {} lacks its sentinel", slot.head_off())
            ));
        }
        Ok((&head[1..head.len() - 1], &body[1..body.len() - 1]))
    }
}

impl Cacheable for ArticleMap {
    type Key = Path;

    fn matches(&self, key: &Path) -> bool {
        self.map.path() == key
    }

    fn is_stale(&self) -> bool {
        self.map.is_unlinked()
    }
}

#[derive(Debug)]
pub struct StoreFile {
    map: MappedFile,
    slots: u32,
}

impl StoreFile {
    /// Opens an article file for writing. A missing file is created when
    /// `create` is set.
    pub fn open(path: &Path, slots: u32, create: bool) -> Result<Self> {
        let open = || OpenOptions::new().read(true).write(true).open(path);
        let file = match open() {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound && create => {
                create_new_atomically(path, &empty_article_file(slots))?;
                open().wrap_err_with(|| format!("failed to open '{}'", path.display()))?
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                bail!(StoreError::not_found(path.display().to_string()))
            }
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to open '{}'", path.display()))
            }
        };
        let mut map = MappedFile::new(path, file, true, ARTICLE_MAP_GRANULE)?;
        check_header(&mut map, slots)?;
        Ok(Self { map, slots })
    }

    pub fn path(&self) -> &Path {
        self.map.path()
    }

    pub fn file(&self) -> &File {
        self.map.file()
    }

    pub fn is_replaced(&self) -> bool {
        self.map.is_unlinked()
    }

    pub fn slot(&mut self, index: u32) -> Result<Slot> {
        read_slot(&mut self.map, index)
    }

    pub fn first_empty_slot(&mut self) -> Result<Option<u32>> {
        for index in 0..self.slots {
            let head_off = self
                .map
                .load_u32(ArticleFileHeader::slot_offset(index) + Slot::HEAD_OFF)?;
            if head_off == 0 {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Appends `0 head 0 0 body 0` in one write and publishes it in slot
    /// `index`. Caller holds the file lock.
    pub fn append_article(&mut self, index: u32, head: &[u8], body: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(head.len() + body.len() + 4);
        record.push(0);
        record.extend_from_slice(head);
        record.push(0);
        record.push(0);
        record.extend_from_slice(body);
        record.push(0);

        let path = self.path().to_path_buf();
        let too_large = || format!("article file '{}' would exceed 4 GiB", path.display());

        let offset = self.map.append(&record)?;
        let head_len = u32::try_from(head.len() + 2).wrap_err_with(too_large)?;
        let body_len = u32::try_from(body.len() + 2).wrap_err_with(too_large)?;
        let head_off = u32::try_from(offset).wrap_err_with(too_large)?;
        let body_off = head_off.checked_add(head_len).ok_or_else(|| eyre::eyre!(too_large()))?;
        if body_off.checked_add(body_len).is_none() {
            bail!(too_large());
        }

        let base = ArticleFileHeader::slot_offset(index);
        self.map.store_u32(base + Slot::HEAD_LEN, head_len)?;
        self.map.store_u32(base + Slot::BODY_LEN, body_len)?;
        self.map.store_u32(base + Slot::BODY_OFF, body_off)?;
        self.map.store_u32(base + Slot::HEAD_OFF, head_off)?;
        Ok(())
    }

    /// Tombstones a slot. Caller holds the file lock.
    pub fn tombstone(&mut self, index: u32) -> Result<()> {
        let base = ArticleFileHeader::slot_offset(index);
        self.map.store_u32(base + Slot::HEAD_OFF, SLOT_TOMBSTONE)?;
        self.map.store_u32(base + Slot::BODY_OFF, SLOT_TOMBSTONE)?;
        Ok(())
    }
}

impl Cacheable for StoreFile {
    type Key = Path;

    fn matches(&self, key: &Path) -> bool {
        self.map.path() == key
    }

    fn is_stale(&self) -> bool {
        self.map.is_unlinked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SlotState;
    use tempfile::tempdir;

    #[test]
    fn stored_article_reads_back_through_a_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut store = StoreFile::open(&path, 4, true).unwrap();

        assert_eq!(store.first_empty_slot().unwrap(), Some(0));
        store.append_article(0, b"Subject: x", b"hi").unwrap();
        assert_eq!(store.first_empty_slot().unwrap(), Some(1));

        let mut map = ArticleMap::open(&path, 4).unwrap();
        let slot = map.slot(0).unwrap();
        assert_eq!(slot.state(), SlotState::Valid);
        assert_eq!(slot.head_len(), 12);
        assert_eq!(slot.body_len(), 4);
        assert!(map.covers(&slot).unwrap());

        let (head, body) = map.article(&slot).unwrap();
        assert_eq!(head, b"Subject: x");
        assert_eq!(body, b"hi");
    }

    #[test]
    fn reopening_with_create_keeps_the_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        StoreFile::open(&path, 4, true)
            .unwrap()
            .append_article(0, b"H", b"B")
            .unwrap();

        let mut store = StoreFile::open(&path, 4, true).unwrap();

        assert_eq!(store.first_empty_slot().unwrap(), Some(1));
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("0")]);
    }

    #[test]
    fn missing_file_without_create_is_not_found() {
        let dir = tempdir().unwrap();

        let err = StoreFile::open(&dir.path().join("7"), 4, false).unwrap_err();

        assert!(StoreError::of(&err).is_some_and(StoreError::is_not_found));
        assert!(!dir.path().join("7").exists());
    }

    #[test]
    fn on_disk_bytes_are_bracketed_by_zeros() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut store = StoreFile::open(&path, 2, true).unwrap();

        store.append_article(0, b"H", b"B").unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let start = ArticleFileHeader::data_start(2) as usize;
        assert_eq!(&bytes[start..], b"\0H\0\0B\0");
    }

    #[test]
    fn tombstoned_slot_reads_as_cancelled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut store = StoreFile::open(&path, 2, true).unwrap();
        store.append_article(0, b"H", b"B").unwrap();

        store.tombstone(0).unwrap();

        let mut map = ArticleMap::open(&path, 2).unwrap();
        assert_eq!(map.slot(0).unwrap().state(), SlotState::Cancelled);
        assert_eq!(map.slot(1).unwrap().state(), SlotState::Empty);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("7");

        let err = ArticleMap::open(&path, 2).unwrap_err();
        assert!(StoreError::of(&err).unwrap().is_not_found());

        let err = StoreFile::open(&path, 2, false).unwrap_err();
        assert!(StoreError::of(&err).unwrap().is_not_found());
    }

    #[test]
    fn slot_count_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        StoreFile::open(&path, 4, true).unwrap();

        let err = ArticleMap::open(&path, 10).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Corrupt { .. })
        ));
    }
}
