//! # Shared, Growable File Mappings
//!
//! `MappedFile` is the one place where spool files are turned into memory.
//! Every component that reads a file through a mapping (the arena, the hash
//! table, article files, time logs) goes through its bounds-checked
//! accessors; raw addresses never leave this module.
//!
//! ## Growth Without Coordination
//!
//! Other processes append to the same files at any time, so the size this
//! process last observed is only a lower bound. The mapping is sized to the
//! observed length rounded up to a growth granule. An access past the
//! observed length triggers one `fstat`; if the file really did grow, the
//! observed length is bumped and, only when the new length also exceeds the
//! mapped length, the file is remapped. Bytes between the observed length
//! and the end of the mapping are never handed out, since touching a page
//! that lies entirely beyond end-of-file raises SIGBUS.
//!
//! ## Safety Model
//!
//! As with the page accessors this design grew out of, remapping requires
//! `&mut self`, and every slice returned borrows `self`. The borrow checker
//! therefore rules out holding a view across a remap:
//!
//! ```text
//! bytes(&mut self, ..) -> &[u8]        // borrows self
//! refresh(&mut self)                   // exclusive, may remap
//! ```
//!
//! ## Pointer-Sized Publication
//!
//! Fields that lock-free readers race against (bucket heads, chain links,
//! free-list heads, slot offsets) are accessed with `load_u32` /
//! `store_u32`, which perform aligned atomic loads with acquire ordering and
//! stores with release ordering directly on the shared mapping. A writer
//! fully writes a record with plain stores, then publishes it with a single
//! `store_u32`; a reader that observes the published word also observes
//! the record.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::StoreError;

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(map) => map,
            Mapping::ReadWrite(map) => map,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    file: File,
    map: Option<Mapping>,
    file_len: u64,
    granule: usize,
    writable: bool,
}

impl MappedFile {
    /// Maps an already opened file. `writable` must match how `file` was
    /// opened; a read-only handle cannot back a writable mapping.
    pub fn new(path: &Path, file: File, writable: bool, granule: usize) -> Result<Self> {
        ensure!(granule > 0, "mapping granule must be positive");

        let mut mapped = Self {
            path: path.to_path_buf(),
            file,
            map: None,
            file_len: 0,
            granule,
            writable,
        };
        mapped.refresh()?;
        Ok(mapped)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// File length as of the last refresh.
    pub fn len(&self) -> u64 {
        self.file_len
    }

    pub fn is_empty(&self) -> bool {
        self.file_len == 0
    }

    pub fn mapped_len(&self) -> usize {
        self.map.as_ref().map_or(0, Mapping::len)
    }

    /// Re-reads the file length and remaps if the file outgrew the mapping.
    /// Returns true when the observed length changed.
    pub fn refresh(&mut self) -> Result<bool> {
        let len = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?
            .len();

        if len == self.file_len && self.map.is_some() {
            return Ok(false);
        }

        if len > self.mapped_len() as u64 || len < self.file_len {
            self.remap(len)?;
        }

        let changed = len != self.file_len;
        self.file_len = len;
        Ok(changed)
    }

    fn remap(&mut self, len: u64) -> Result<()> {
        self.map = None;
        if len == 0 {
            return Ok(());
        }

        let granule = self.granule as u64;
        let map_len = usize::try_from(len.div_ceil(granule) * granule)
            .wrap_err("file too large to map")?;

        // SAFETY: mapping a file is unsafe because another process may
        // modify or truncate it underneath us. Spool files are only ever
        // appended to or replaced by rename. The one in-place truncation
        // cuts a torn time record, and readers only access whole records.
        // Every access is bounds-checked against `file_len`, which never
        // exceeds the real file length, so no access touches a page beyond
        // end-of-file. Concurrent in-place updates are limited to aligned
        // words accessed atomically and to bytes a lock holder owns.
        let map = unsafe {
            if self.writable {
                Mapping::ReadWrite(
                    MmapOptions::new()
                        .len(map_len)
                        .map_mut(&self.file)
                        .wrap_err_with(|| format!("failed to map '{}'", self.path.display()))?,
                )
            } else {
                Mapping::ReadOnly(
                    MmapOptions::new()
                        .len(map_len)
                        .map(&self.file)
                        .wrap_err_with(|| format!("failed to map '{}'", self.path.display()))?,
                )
            }
        };

        self.map = Some(map);
        Ok(())
    }

    /// True when `[offset, offset + len)` lies inside the file, refreshing
    /// once if the range is past the last observed end.
    pub fn covers(&mut self, offset: u64, len: usize) -> Result<bool> {
        let Some(end) = offset.checked_add(len as u64) else {
            return Ok(false);
        };
        if end <= self.file_len {
            return Ok(true);
        }
        self.refresh()?;
        Ok(end <= self.file_len)
    }

    fn check_range(&mut self, offset: u64, len: usize) -> Result<usize> {
        if !self.covers(offset, len)? {
            bail!(StoreError::corrupt(
                &self.path,
                format!(
                    "range {}+{} is beyond end of file ({} bytes)",
                    offset, len, self.file_len
                )
            ));
        }
        Ok(offset as usize)
    }

    pub fn bytes(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        self.get(offset, len)
    }

    /// Borrows a range without refreshing; the range must lie within the
    /// length observed by the last refresh.
    pub fn get(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.file_len) {
            bail!(StoreError::corrupt(
                &self.path,
                format!(
                    "range {}+{} is beyond end of file ({} bytes)",
                    offset, len, self.file_len
                )
            ));
        }
        if len == 0 {
            return Ok(&[]);
        }
        let start = offset as usize;
        Ok(&self.mapped()?[start..start + len])
    }

    pub fn bytes_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        self.ensure_writable()?;
        let start = self.check_range(offset, len)?;
        if len == 0 {
            return Ok(&mut []);
        }
        match self.map.as_mut() {
            Some(Mapping::ReadWrite(map)) => Ok(&mut map[start..start + len]),
            _ => bail!(StoreError::ReadOnly {
                path: self.path.clone()
            }),
        }
    }

    fn mapped(&self) -> Result<&[u8]> {
        match &self.map {
            Some(map) => Ok(map.as_slice()),
            None => bail!(StoreError::corrupt(&self.path, "file is not mapped")),
        }
    }

    fn word(&mut self, offset: u64) -> Result<&AtomicU32> {
        ensure!(
            offset % 4 == 0,
            "unaligned word access at {} in '{}'",
            offset,
            self.path.display()
        );
        let start = self.check_range(offset, 4)?;
        let ptr = self.mapped()?[start..start + 4].as_ptr();

        // SAFETY: the four bytes are in bounds of a live mapping whose base
        // is page aligned, and `offset` is a multiple of four, so the pointer
        // is valid and aligned for AtomicU32, which has the same layout as
        // u32. The reference borrows `self`, so the mapping outlives it.
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    pub fn load_u32(&mut self, offset: u64) -> Result<u32> {
        Ok(u32::from_le(self.word(offset)?.load(Ordering::Acquire)))
    }

    pub fn store_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.ensure_writable()?;
        self.word(offset)?.store(value.to_le(), Ordering::Release);
        Ok(())
    }

    /// Appends `data` at the current end of file and returns its offset.
    /// The caller is expected to hold the file's lock.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        self.ensure_writable()?;
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .wrap_err_with(|| format!("failed to seek in '{}'", self.path.display()))?;
        self.file
            .write_all(data)
            .wrap_err_with(|| format!("failed to append to '{}'", self.path.display()))?;
        self.refresh()?;
        Ok(offset)
    }

    /// Extends the file with zero bytes and returns the old length.
    pub fn extend_zeroed(&mut self, additional: u64) -> Result<u64> {
        self.ensure_writable()?;
        self.refresh()?;
        let old = self.file_len;
        self.file
            .set_len(old + additional)
            .wrap_err_with(|| {
                format!(
                    "failed to extend '{}' to {} bytes",
                    self.path.display(),
                    old + additional
                )
            })?;
        self.refresh()?;
        Ok(old)
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(Mapping::ReadWrite(map)) = &self.map {
            map.flush()
                .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))?;
        }
        Ok(())
    }

    /// True once the file this mapping was made from has been unlinked or
    /// replaced by a rename; the mapping still works but shows stale data.
    pub fn is_unlinked(&self) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            match self.file.metadata() {
                Ok(meta) => meta.nlink() == 0,
                Err(_) => true,
            }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            bail!(StoreError::ReadOnly {
                path: self.path.clone()
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn create(path: &Path, contents: &[u8]) -> MappedFile {
        std::fs::write(path, contents).unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .unwrap();
        MappedFile::new(path, file, true, 4096).unwrap()
    }

    #[test]
    fn maps_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut mapped = create(&path, b"hello world");

        assert_eq!(mapped.len(), 11);
        assert_eq!(mapped.bytes(6, 5).unwrap(), b"world");
    }

    #[test]
    fn out_of_range_access_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut mapped = create(&path, b"abc");

        let err = mapped.bytes(2, 2).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn sees_growth_by_another_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut mapped = create(&path, b"abcd");

        let mut other = OpenOptions::new().append(true).open(&path).unwrap();
        other.write_all(&vec![7u8; 10_000]).unwrap();

        assert_eq!(mapped.bytes(9_000, 4).unwrap(), &[7, 7, 7, 7]);
        assert_eq!(mapped.len(), 10_004);
        assert!(mapped.mapped_len() >= 10_004);
    }

    #[test]
    fn words_round_trip_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut mapped = create(&path, &[0u8; 16]);

        mapped.store_u32(8, 0xdead_beef).unwrap();

        assert_eq!(mapped.load_u32(8).unwrap(), 0xdead_beef);
        assert_eq!(mapped.bytes(8, 4).unwrap(), &0xdead_beefu32.to_le_bytes());
        assert!(mapped.load_u32(6).is_err());
    }

    #[test]
    fn append_and_extend_return_old_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut mapped = create(&path, b"xy");

        assert_eq!(mapped.append(b"zz").unwrap(), 2);
        assert_eq!(mapped.extend_zeroed(4).unwrap(), 4);
        assert_eq!(mapped.bytes(0, 8).unwrap(), b"xyzz\0\0\0\0");
    }

    #[test]
    fn read_only_mapping_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, [0u8; 8]).unwrap();
        let file = File::open(&path).unwrap();
        let mut mapped = MappedFile::new(&path, file, false, 4096).unwrap();

        let err = mapped.store_u32(0, 1).unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::ReadOnly { .. })
        ));
        assert_eq!(mapped.load_u32(4).unwrap(), 0);
    }

    #[test]
    fn detects_replacement_by_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mapped = create(&path, b"old");

        assert!(!mapped.is_unlinked());

        let replacement = dir.path().join("g");
        std::fs::write(&replacement, b"new").unwrap();
        std::fs::rename(&replacement, &path).unwrap();

        assert!(mapped.is_unlinked());
    }
}
