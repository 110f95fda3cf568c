//! # Article Archive
//!
//! Articles are stored per newsgroup in numbered files of `K` slots each
//! (`K` defaults to 10). Serial `s` lives in file `s / K`, slot `s % K`:
//!
//! ```text
//! root/comp.lang.rust/
//! ├── 0    serials 0..9
//! ├── 1    serials 10..19
//! └── 2    serials 20..29   <- current file, stores go here
//! ```
//!
//! ## Article File Layout
//!
//! ```text
//! Offset   Size    Field
//! 0        4       magic (0x000face0)
//! 4        4       slot count K
//! 8        16*K    slots: head_off, head_len, body_off, body_len
//! 8+16K    ...     articles, each stored as  0 head 0 0 body 0
//! ```
//!
//! Slot lengths include the zero sentinels. A cancelled slot has both
//! offsets set to `0xffff_ffff`.
//!
//! ## Storing
//!
//! A store starts at the group's highest-numbered file, takes that file's
//! advisory lock, and claims the first slot whose head offset is zero. The
//! article is appended at end of file in one write, then published: lengths
//! and body offset first, head offset last. A reader that sees a non-zero
//! head offset therefore sees a complete article. When the file has no free
//! slot the next number is tried, and when a store takes the last slot the
//! file is compacted right away (see `compact`).
//!
//! ## Fetching
//!
//! Fetches never lock. They go through a cache of read-only mappings; a
//! slot that points past the mapped length (the file grew since it was
//! mapped) triggers one refresh, after which it is reported as corruption.
//! Mappings of files that compaction has since replaced are detected as
//! stale and reopened.
//!
//! A fetch follows alias records (empty body, a head that is the single
//! line `Message-ID: group:serial<id>`) up to ten hops. Any other record,
//! including a real article with an empty body, is returned as it is. Returned views borrow the archive, so they cannot
//! outlive the mapping they point into.

mod compact;
mod file;
mod header;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, error, warn};

use crate::cache::{CacheId, CacheStats, ObjectCache};
use crate::config::{AccessOptions, SpoolConfig, MAX_ALIAS_HOPS};
use crate::error::StoreError;
use crate::newsgroup::validate_group_name;
use crate::storage::{FileLock, Slot, SlotState};

use file::{article_path, ArticleMap, StoreFile};

pub use compact::CompactOutcome;
pub use header::{encode_alias, header_field, is_alias, parse_alias};

/// A stored article, borrowed from the archive's mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleView<'a> {
    /// Where the article actually lives, after following aliases.
    pub group: String,
    pub serial: u32,
    pub head: &'a [u8],
    pub body: &'a [u8],
}

impl ArticleView<'_> {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        header_field(self.head, name)
    }

    pub fn message_id(&self) -> Option<String> {
        self.header("Message-ID")
            .map(|id| String::from_utf8_lossy(id).into_owned())
    }
}

enum StoreAttempt {
    Stored(u32),
    Full,
    Replaced,
}

#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    slots: u32,
    access: AccessOptions,
    maps: ObjectCache<ArticleMap>,
    stores: ObjectCache<StoreFile>,
}

impl Archive {
    pub fn open(config: &SpoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            root: config.root.clone(),
            slots: config.articles_per_file,
            access: config.access,
            maps: ObjectCache::new(CacheId::ARTICLE_MAPS, config.article_cache_capacity)?,
            stores: ObjectCache::new(CacheId::STORE_FILES, config.store_cache_capacity)?,
        })
    }

    pub fn articles_per_file(&self) -> u32 {
        self.slots
    }

    pub fn file_of(&self, serial: u32) -> u32 {
        serial / self.slots
    }

    pub fn map_stats(&self) -> CacheStats {
        self.maps.stats()
    }

    pub fn store_stats(&self) -> CacheStats {
        self.stores.stats()
    }

    pub fn store(&mut self, group: &str, head: &[u8], body: &[u8]) -> Result<u32> {
        validate_group_name(group)?;
        self.ensure_writable()?;

        let dir = self.root.join(group);
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create group directory '{}'", dir.display()))?;

        let head = header::scrub_tabs(head);
        let mut number = self.file_numbers(group)?.last().copied().unwrap_or(0);

        loop {
            let path = article_path(&self.root, group, number);
            match self.try_store(&path, &head, body)? {
                StoreAttempt::Replaced => {
                    debug!(path = %path.display(), "article file replaced, reopening");
                    self.stores.invalidate(&path);
                }
                StoreAttempt::Full => {
                    self.stores.invalidate(&path);
                    number = number
                        .checked_add(1)
                        .ok_or_else(|| eyre::eyre!("group {} has run out of file numbers", group))?;
                }
                StoreAttempt::Stored(index) => {
                    let serial = number
                        .checked_mul(self.slots)
                        .and_then(|base| base.checked_add(index))
                        .ok_or_else(|| eyre::eyre!("group {} has run out of serials", group))?;

                    if index == self.slots - 1 {
                        self.stores.invalidate(&path);
                        if let Err(err) = compact::compact_file(&dir, number, self.slots) {
                            error!(group, file = number, %err, "compaction failed");
                        }
                        self.maps.invalidate(&path);
                    }
                    return Ok(serial);
                }
            }
        }
    }

    fn try_store(&mut self, path: &Path, head: &[u8], body: &[u8]) -> Result<StoreAttempt> {
        let policy = self.access.lock;
        let store = self.store_file(path, true)?;
        let _lock = FileLock::acquire(store.file(), path, &policy)?;

        if store.is_replaced() {
            return Ok(StoreAttempt::Replaced);
        }
        let Some(index) = store.first_empty_slot()? else {
            return Ok(StoreAttempt::Full);
        };
        store.append_article(index, head, body)?;
        Ok(StoreAttempt::Stored(index))
    }

    /// Stores an alias record in `group` that redirects fetches to
    /// `target_group:target_serial`.
    pub fn store_alias(
        &mut self,
        group: &str,
        target_group: &str,
        target_serial: u32,
        message_id: &str,
    ) -> Result<u32> {
        validate_group_name(target_group)?;
        ensure!(
            message_id.starts_with('<'),
            "alias message-id {:?} must start with '<'",
            message_id
        );
        let head = encode_alias(target_group, target_serial, message_id);
        self.store(group, &head, b"")
    }

    /// Fetches an article, following aliases.
    pub fn fetch(&mut self, group: &str, serial: u32) -> Result<ArticleView<'_>> {
        let mut target = (group.to_string(), serial);

        for _ in 0..MAX_ALIAS_HOPS {
            let slot = self.locate(&target.0, target.1)?;
            let next = {
                let map = self.current_map()?;
                let (head, body) = map.article(&slot)?;
                if is_alias(head, body) {
                    parse_alias(head)
                } else {
                    None
                }
            };

            match next {
                Some(redirect) => target = redirect,
                None => return self.view(target.0, target.1, slot),
            }
        }

        warn!(group, serial, "too many aliases");
        bail!(StoreError::TooManyAliases {
            group: group.to_string(),
            serial,
        })
    }

    /// Fetches exactly the record at `group:serial`; alias records are
    /// returned as they are.
    pub fn fetch_raw(&mut self, group: &str, serial: u32) -> Result<ArticleView<'_>> {
        let slot = self.locate(group, serial)?;
        self.view(group.to_string(), serial, slot)
    }

    fn view(&mut self, group: String, serial: u32, slot: Slot) -> Result<ArticleView<'_>> {
        let map = self.current_map()?;
        let (head, body) = map.article(&slot)?;
        Ok(ArticleView {
            group,
            serial,
            head,
            body,
        })
    }

    /// Resolves a serial to a valid slot whose bytes are inside the mapped
    /// file. A slot past the observed end is retried once against a fresh
    /// length before it counts as corruption. On success the file's mapping is the most recently used entry
    /// of the map cache.
    fn locate(&mut self, group: &str, serial: u32) -> Result<Slot> {
        validate_group_name(group)?;
        let path = article_path(&self.root, group, self.file_of(serial));
        let index = serial % self.slots;

        let map = self.article_map(&path)?;
        let slot = map.slot(index)?;

        match slot.state() {
            SlotState::Empty => {
                bail!(StoreError::not_found(format!("{}:{}", group, serial)))
            }
            SlotState::Cancelled => bail!(StoreError::Cancelled {
                group: group.to_string(),
                serial,
            }),
            SlotState::Corrupt => {
                error!(group, serial, path = %path.display(), "corrupt slot");
                bail!(StoreError::not_found(format!("{}:{}", group, serial)))
            }
            SlotState::Valid => {}
        }

        // a store published after our last stat: `covers` re-stats once
        if map.covers(&slot)? {
            return Ok(slot);
        }

        error!(group, serial, path = %path.display(), "article extends beyond end of file");
        bail!(StoreError::corrupt(
            path,
            format!("article {} extends beyond end of file", serial)
        ))
    }

    fn article_map(&mut self, path: &Path) -> Result<&mut ArticleMap> {
        if self.maps.find(path).is_none() {
            let map = ArticleMap::open(path, self.slots)?;
            return Ok(self.maps.insert(map));
        }
        self.current_map()
    }

    fn current_map(&mut self) -> Result<&mut ArticleMap> {
        self.maps
            .top()
            .ok_or_else(|| eyre::eyre!("article map cache is empty"))
    }

    fn store_file(&mut self, path: &Path, create: bool) -> Result<&mut StoreFile> {
        if self.stores.find(path).is_none() {
            let store = StoreFile::open(path, self.slots, create)?;
            return Ok(self.stores.insert(store));
        }
        self.stores
            .top()
            .ok_or_else(|| eyre::eyre!("store file cache is empty"))
    }

    /// Tombstones `group:serial` under the file's lock.
    pub fn cancel(&mut self, group: &str, serial: u32) -> Result<()> {
        validate_group_name(group)?;
        self.ensure_writable()?;

        let path = article_path(&self.root, group, self.file_of(serial));
        let index = serial % self.slots;
        let policy = self.access.lock;

        for _ in 0..2 {
            let store = self.store_file(&path, false)?;
            let _lock = FileLock::acquire(store.file(), &path, &policy)?;
            if store.is_replaced() {
                self.stores.invalidate(&path);
                continue;
            }

            let slot = store.slot(index)?;
            return match slot.state() {
                SlotState::Valid => store.tombstone(index),
                SlotState::Empty => bail!(StoreError::not_found(format!("{}:{}", group, serial))),
                SlotState::Cancelled => bail!(StoreError::Cancelled {
                    group: group.to_string(),
                    serial,
                }),
                SlotState::Corrupt => {
                    error!(group, serial, path = %path.display(), "corrupt slot, cannot cancel");
                    bail!(StoreError::corrupt(
                        &path,
                        format!("slot for serial {} is corrupt", serial)
                    ))
                }
            };
        }

        bail!(StoreError::LockTimeout {
            path,
            attempts: 2
        })
    }

    /// Numbers of the group's article files, ascending.
    pub fn file_numbers(&self, group: &str) -> Result<Vec<u32>> {
        validate_group_name(group)?;
        let dir = self.root.join(group);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to list '{}'", dir.display()))
            }
        };

        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry.wrap_err_with(|| format!("failed to list '{}'", dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(number) = name.parse() {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Lowest and highest serial holding a live article, if any.
    pub fn group_range(&mut self, group: &str) -> Result<Option<(u32, u32)>> {
        let numbers = self.file_numbers(group)?;

        let mut low = None;
        for &number in &numbers {
            if let Some(index) = self.live_slots(group, number)?.first() {
                low = Some(number * self.slots + index);
                break;
            }
        }
        let Some(low) = low else {
            return Ok(None);
        };

        for &number in numbers.iter().rev() {
            if let Some(index) = self.live_slots(group, number)?.last() {
                return Ok(Some((low, number * self.slots + index)));
            }
        }
        Ok(None)
    }

    /// Slot indexes of valid articles in one file.
    pub fn live_slots(&mut self, group: &str, number: u32) -> Result<Vec<u32>> {
        let path = article_path(&self.root, group, number);
        let slots = self.slots;
        let map = match self.article_map(&path) {
            Ok(map) => map,
            Err(err) if StoreError::of(&err).is_some_and(StoreError::is_not_found) => {
                return Ok(Vec::new())
            }
            Err(err) => return Err(err),
        };

        let mut live = Vec::new();
        for index in 0..slots {
            if map.slot(index)?.state() == SlotState::Valid {
                live.push(index);
            }
        }
        Ok(live)
    }

    /// Deletes one article file. Returns false if it did not exist.
    pub fn remove_file(&mut self, group: &str, number: u32) -> Result<bool> {
        validate_group_name(group)?;
        self.ensure_writable()?;

        let path = article_path(&self.root, group, number);
        self.maps.invalidate(&path);
        self.stores.invalidate(&path);

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).wrap_err_with(|| format!("failed to remove '{}'", path.display())),
        }
    }

    /// Drops every cached handle.
    pub fn close(&mut self) {
        self.maps.clear();
        self.stores.clear();
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.access.read_only {
            bail!(StoreError::ReadOnly {
                path: self.root.clone()
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn archive(root: &Path, slots: u32) -> Archive {
        let mut config = SpoolConfig::new(root);
        config.articles_per_file = slots;
        Archive::open(&config).unwrap()
    }

    fn not_found(err: &eyre::Report) -> bool {
        StoreError::of(err).is_some_and(StoreError::is_not_found)
    }

    #[test]
    fn serials_are_consecutive_across_files() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 3);

        let serials: Vec<u32> = (0..7)
            .map(|i| {
                archive
                    .store("alt.test", format!("Subject: {}", i).as_bytes(), b"x")
                    .unwrap()
            })
            .collect();

        assert_eq!(serials, (0..7).collect::<Vec<_>>());
        assert_eq!(archive.file_numbers("alt.test").unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn fetch_returns_what_was_stored_across_compaction() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 3);

        for i in 0..6 {
            let head = format!("Subject: {}", i);
            let body = format!("body {}", i);
            archive
                .store("comp.test", head.as_bytes(), body.as_bytes())
                .unwrap();
        }

        for i in 0..6u32 {
            let view = archive.fetch("comp.test", i).unwrap();
            assert_eq!(view.head, format!("Subject: {}", i).as_bytes());
            assert_eq!(view.body, format!("body {}", i).as_bytes());
            assert_eq!(view.serial, i);
        }
    }

    #[test]
    fn full_files_are_compacted() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 2);

        archive.store("g", b"H0", b"B0").unwrap();
        archive.store("g", b"H1", b"B1").unwrap();

        let bytes = fs::read(dir.path().join("g").join("0")).unwrap();
        let start = crate::storage::ArticleFileHeader::data_start(2) as usize;
        assert_eq!(&bytes[start..], b"\0H0\0\0H1\0\0B0\0\0B1\0");
        assert!(!dir.path().join("g").join("+0").exists());
    }

    #[test]
    fn tabs_in_heads_are_replaced() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 10);

        let serial = archive.store("g", b"Subject:\tx\ty", b"b").unwrap();

        assert_eq!(archive.fetch("g", serial).unwrap().head, b"Subject: x y");
    }

    #[test]
    fn missing_and_empty_are_not_found() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 10);

        assert!(not_found(&archive.fetch("g", 0).unwrap_err()));
        archive.store("g", b"H", b"B").unwrap();
        assert!(not_found(&archive.fetch("g", 1).unwrap_err()));
        assert!(not_found(&archive.fetch("g", 25).unwrap_err()));
    }

    #[test]
    fn cancel_tombstones_and_survives_compaction() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 3);

        archive.store("g", b"H0", b"B0").unwrap();
        archive.store("g", b"H1", b"B1").unwrap();
        archive.cancel("g", 0).unwrap();

        let err = archive.fetch("g", 0).unwrap_err();
        assert_eq!(
            StoreError::of(&err),
            Some(&StoreError::Cancelled {
                group: "g".to_string(),
                serial: 0
            })
        );

        archive.store("g", b"H2", b"B2").unwrap();

        assert!(matches!(
            StoreError::of(&archive.fetch("g", 0).unwrap_err()),
            Some(StoreError::Cancelled { .. })
        ));
        assert_eq!(archive.fetch("g", 1).unwrap().body, b"B1");
        assert_eq!(archive.fetch("g", 2).unwrap().body, b"B2");

        assert!(matches!(
            StoreError::of(&archive.cancel("g", 0).unwrap_err()),
            Some(StoreError::Cancelled { .. })
        ));
        assert!(not_found(&archive.cancel("g", 7).unwrap_err()));
    }

    #[test]
    fn aliases_are_followed() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 10);

        let primary = archive.store("comp.a", b"Subject: x", b"body").unwrap();
        let alias = archive
            .store_alias("comp.b", "comp.a", primary, "<x@y>")
            .unwrap();

        let view = archive.fetch("comp.b", alias).unwrap();
        assert_eq!(view.group, "comp.a");
        assert_eq!(view.serial, primary);
        assert_eq!(view.body, b"body");

        let raw = archive.fetch_raw("comp.b", alias).unwrap();
        assert!(is_alias(raw.head, raw.body));
    }

    #[test]
    fn alias_cycles_are_cut_off() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 10);

        archive.store_alias("a.a", "b.b", 0, "<c@y>").unwrap();
        archive.store_alias("b.b", "a.a", 0, "<c@y>").unwrap();

        let err = archive.fetch("a.a", 0).unwrap_err();
        assert_eq!(
            StoreError::of(&err),
            Some(&StoreError::TooManyAliases {
                group: "a.a".to_string(),
                serial: 0
            })
        );
    }

    #[test]
    fn group_range_spans_live_articles() {
        let dir = tempdir().unwrap();
        let mut archive = archive(dir.path(), 2);

        assert_eq!(archive.group_range("g").unwrap(), None);
        for _ in 0..5 {
            archive.store("g", b"H", b"B").unwrap();
        }
        archive.cancel("g", 0).unwrap();
        assert_eq!(archive.group_range("g").unwrap(), Some((1, 4)));

        assert!(archive.remove_file("g", 0).unwrap());
        assert!(!archive.remove_file("g", 0).unwrap());
        assert_eq!(archive.group_range("g").unwrap(), Some((2, 4)));
        assert_eq!(archive.file_numbers("g").unwrap(), vec![1, 2]);
    }

    #[test]
    fn second_archive_sees_stores_and_continues_numbering() {
        let dir = tempdir().unwrap();
        let mut first = archive(dir.path(), 4);
        let mut second = archive(dir.path(), 4);

        assert_eq!(first.store("g", b"H0", b"B0").unwrap(), 0);
        assert_eq!(second.fetch("g", 0).unwrap().body, b"B0");
        assert_eq!(second.store("g", b"H1", b"B1").unwrap(), 1);
        assert_eq!(first.fetch("g", 1).unwrap().body, b"B1");
        assert_eq!(first.store("g", b"H2", b"B2").unwrap(), 2);
    }

    #[test]
    fn cached_mapping_picks_up_a_later_store_in_the_same_file() {
        let dir = tempdir().unwrap();
        let mut reader = archive(dir.path(), 4);
        let mut writer = archive(dir.path(), 4);

        writer.store("g", b"H0", b"B0").unwrap();
        assert_eq!(reader.fetch("g", 0).unwrap().body, b"B0");
        let before = reader.map_stats();

        writer.store("g", b"H1", b"a longer body than the first").unwrap();

        assert_eq!(
            reader.fetch("g", 1).unwrap().body,
            b"a longer body than the first"
        );
        let after = reader.map_stats();
        assert_eq!(after.hits, before.hits + 1);
        assert_eq!(after.misses, before.misses);
    }

    #[test]
    fn read_only_archive_refuses_writes() {
        let dir = tempdir().unwrap();
        archive(dir.path(), 10).store("g", b"H", b"B").unwrap();

        let mut config = SpoolConfig::new(dir.path());
        config.access.read_only = true;
        let mut archive = Archive::open(&config).unwrap();

        assert_eq!(archive.fetch("g", 0).unwrap().body, b"B");
        assert!(matches!(
            StoreError::of(&archive.store("g", b"H", b"B").unwrap_err()),
            Some(StoreError::ReadOnly { .. })
        ));
    }
}
