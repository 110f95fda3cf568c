//! # Temporal Index
//!
//! Every group directory has a `.times` log: one 12-byte record per stored
//! article, appended in arrival order.
//!
//! ```text
//! Offset  Size  Field
//! 0       4     serial
//! 4       8     stored_at (seconds since the Unix epoch)
//! ```
//!
//! Records are non-decreasing in `stored_at`, so cutoff queries are a
//! binary search over the mapped log. The log is written through an
//! append-mode handle and read through a read-only mapping; a record that
//! is still being appended is ignored until it is whole. A partial record
//! left behind by a crash is cut off by the next appender, under the lock,
//! before it writes.
//!
//! ## Cutoff Queries
//!
//! [`TimesIndex::since`] answers "where does `cutoff` fall in this group":
//!
//! ```text
//! records:   t0   t1   t2   t3
//!         ^    ^         ^      ^
//!         |    |         |      └─ after t3: Nothing
//!         |    |         └─ t2 <= c < t3: Boundary(serial of t2)
//!         |    └─ t0 <= c < t1: Boundary(serial of t0)
//!         └─ before t0: Everything
//! ```
//!
//! An empty or missing log is `Nothing`.
//!
//! ## Expiry
//!
//! [`TimesIndex::expire`] drops the leading records whose serial is below a
//! bound by writing the rest to `.times.tmp` and renaming it over the log,
//! holding the log's lock. Appenders take the same lock and reopen the log
//! if they find their handle was replaced, so a record is not appended to
//! an unlinked file by a process that raced the rename.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, Result, WrapErr};
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::cache::{CacheId, CacheStats, Cacheable, ObjectCache};
use crate::config::{
    AccessOptions, TIMES_FILE_NAME, TIMES_MAP_GRANULE, TIMES_RECORD_SIZE, TIMES_TMP_FILE_NAME,
};
use crate::error::StoreError;
use crate::newsgroup::validate_group_name;
use crate::storage::{FileLock, MappedFile, TimesRecord};

/// Where a cutoff time falls in a group's arrival log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Since {
    /// Every recorded article arrived after the cutoff.
    Everything,
    /// No recorded article arrived after the cutoff, or there are none.
    Nothing,
    /// Serial of the newest article stored at or before the cutoff.
    Boundary(u32),
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
struct TimesLog {
    group: String,
    map: MappedFile,
}

impl TimesLog {
    /// Opens the group's log. Returns `None` for a read-only spool whose
    /// group has no log yet.
    fn open(root: &Path, group: &str, access: &AccessOptions) -> Result<Option<Self>> {
        let dir = root.join(group);
        let path = dir.join(TIMES_FILE_NAME);

        let file = if access.read_only {
            match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(err)
                        .wrap_err_with(|| format!("failed to open '{}'", path.display()))
                }
            }
        } else {
            fs::create_dir_all(&dir).wrap_err_with(|| {
                format!("failed to create group directory '{}'", dir.display())
            })?;
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to open '{}'", path.display()))?
        };

        let map = MappedFile::new(&path, file, false, TIMES_MAP_GRANULE)?;
        if map.len() % TIMES_RECORD_SIZE as u64 != 0 {
            warn!(group, len = map.len(), "time log has a partial trailing record");
        }
        Ok(Some(Self {
            group: group.to_string(),
            map,
        }))
    }

    fn path(&self) -> &Path {
        self.map.path()
    }

    fn records(&mut self) -> Result<&[TimesRecord]> {
        self.map.refresh()?;
        let len = self.map.len() as usize;
        let whole = len - len % TIMES_RECORD_SIZE;
        TimesRecord::slice_from_bytes(self.map.get(0, whole)?)
    }

    /// Cuts a partial trailing record left by an interrupted append, so the
    /// next record starts on a record boundary. Caller holds the log lock.
    fn trim_partial(&mut self) -> Result<()> {
        let path = self.path().to_path_buf();
        let len = self
            .map
            .file()
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        let whole = len - len % TIMES_RECORD_SIZE as u64;
        if whole == len {
            return Ok(());
        }

        warn!(group = %self.group, len, "dropping partial trailing time record");
        self.map
            .file()
            .set_len(whole)
            .wrap_err_with(|| format!("failed to truncate '{}'", path.display()))?;
        self.map.refresh()?;
        Ok(())
    }

    fn write(&mut self, record: &TimesRecord) -> Result<()> {
        let mut file = self.map.file();
        file.write_all(record.as_bytes())
            .wrap_err_with(|| format!("failed to append to '{}'", self.path().display()))
    }
}

impl Cacheable for TimesLog {
    type Key = str;

    fn matches(&self, group: &str) -> bool {
        self.group == group
    }

    fn is_stale(&self) -> bool {
        self.map.is_unlinked()
    }
}

#[derive(Debug)]
pub struct TimesIndex {
    root: PathBuf,
    access: AccessOptions,
    logs: ObjectCache<TimesLog>,
}

impl TimesIndex {
    pub fn open(root: &Path, access: AccessOptions, cache_capacity: usize) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            access,
            logs: ObjectCache::new(CacheId::TIME_LOGS, cache_capacity)?,
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.logs.stats()
    }

    /// Records that `serial` was stored now.
    pub fn append(&mut self, group: &str, serial: u32) -> Result<()> {
        self.append_at(group, serial, unix_now())
    }

    pub fn append_at(&mut self, group: &str, serial: u32, stored_at: u64) -> Result<()> {
        validate_group_name(group)?;
        self.ensure_writable()?;
        let record = TimesRecord::new(serial, stored_at);
        let policy = self.access.lock;

        for _ in 0..2 {
            let Some(log) = self.log(group)? else {
                bail!(StoreError::not_found(format!("time log for {}", group)));
            };
            let path = log.path().to_path_buf();
            let _lock = FileLock::acquire(log.map.file(), &path, &policy)?;

            if log.map.is_unlinked() {
                debug!(group, "time log replaced, reopening");
                self.logs.invalidate(group);
                continue;
            }
            if let Err(err) = log.trim_partial().and_then(|_| log.write(&record)) {
                warn!(group, serial, %err, "time log append failed");
                self.logs.invalidate(group);
                return Err(err);
            }
            return Ok(());
        }

        bail!(StoreError::LockTimeout {
            path: self.log_path(group),
            attempts: 2
        })
    }

    pub fn since(&mut self, group: &str, cutoff: u64) -> Result<Since> {
        validate_group_name(group)?;
        let Some(log) = self.log(group)? else {
            return Ok(Since::Nothing);
        };
        let records = log.records()?;

        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(Since::Nothing);
        };
        if cutoff < first.stored_at() {
            return Ok(Since::Everything);
        }
        if cutoff > last.stored_at() {
            return Ok(Since::Nothing);
        }

        let newer = records.partition_point(|r| r.stored_at() <= cutoff);
        Ok(Since::Boundary(records[newer - 1].serial()))
    }

    /// Drops leading records whose serial is below `until`. Returns how
    /// many were dropped.
    pub fn expire(&mut self, group: &str, until: u32) -> Result<usize> {
        validate_group_name(group)?;
        self.ensure_writable()?;
        let policy = self.access.lock;
        let tmp = self.root.join(group).join(TIMES_TMP_FILE_NAME);

        let Some(log) = self.log(group)? else {
            return Ok(0);
        };
        let path = log.path().to_path_buf();
        let lock = FileLock::acquire(log.map.file(), &path, &policy)?;

        let records = log.records()?;
        let dropped = records
            .iter()
            .position(|r| r.serial() >= until)
            .unwrap_or(records.len());
        if dropped == 0 {
            return Ok(0);
        }

        let mut out = File::create(&tmp)
            .wrap_err_with(|| format!("failed to create '{}'", tmp.display()))?;
        out.write_all(records[dropped..].as_bytes())
            .and_then(|_| out.sync_all())
            .wrap_err_with(|| format!("failed to write '{}'", tmp.display()))?;
        fs::rename(&tmp, &path).wrap_err_with(|| {
            format!("failed to rename '{}' over '{}'", tmp.display(), path.display())
        })?;

        drop(lock);
        self.logs.invalidate(group);
        debug!(group, until, dropped, "expired time records");
        Ok(dropped)
    }

    /// Copy of every whole record in the group's log.
    pub fn records(&mut self, group: &str) -> Result<Vec<TimesRecord>> {
        validate_group_name(group)?;
        match self.log(group)? {
            Some(log) => Ok(log.records()?.to_vec()),
            None => Ok(Vec::new()),
        }
    }

    pub fn close(&mut self) {
        self.logs.clear();
    }

    fn log(&mut self, group: &str) -> Result<Option<&mut TimesLog>> {
        if self.logs.find(group).is_none() {
            let Some(log) = TimesLog::open(&self.root, group, &self.access)? else {
                return Ok(None);
            };
            return Ok(Some(self.logs.insert(log)));
        }
        Ok(self.logs.top())
    }

    fn log_path(&self, group: &str) -> PathBuf {
        self.root.join(group).join(TIMES_FILE_NAME)
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

    fn index(root: &Path) -> TimesIndex {
        TimesIndex::open(root, AccessOptions::default(), 3).unwrap()
    }

    fn seeded(root: &Path) -> TimesIndex {
        let mut times = index(root);
        for (serial, at) in [(0, 100), (1, 200), (2, 200), (3, 300)] {
            times.append_at("g", serial, at).unwrap();
        }
        times
    }

    #[test]
    fn empty_log_is_nothing() {
        let dir = tempdir().unwrap();
        let mut times = index(dir.path());

        assert_eq!(times.since("g", 0).unwrap(), Since::Nothing);
        assert!(times.records("g").unwrap().is_empty());
    }

    #[test]
    fn cutoffs_fall_between_records() {
        let dir = tempdir().unwrap();
        let mut times = seeded(dir.path());

        assert_eq!(times.since("g", 99).unwrap(), Since::Everything);
        assert_eq!(times.since("g", 100).unwrap(), Since::Boundary(0));
        assert_eq!(times.since("g", 150).unwrap(), Since::Boundary(0));
        assert_eq!(times.since("g", 200).unwrap(), Since::Boundary(2));
        assert_eq!(times.since("g", 299).unwrap(), Since::Boundary(2));
        assert_eq!(times.since("g", 300).unwrap(), Since::Boundary(3));
        assert_eq!(times.since("g", 301).unwrap(), Since::Nothing);
    }

    #[test]
    fn single_record_log() {
        let dir = tempdir().unwrap();
        let mut times = index(dir.path());
        times.append_at("g", 7, 50).unwrap();

        assert_eq!(times.since("g", 49).unwrap(), Since::Everything);
        assert_eq!(times.since("g", 50).unwrap(), Since::Boundary(7));
        assert_eq!(times.since("g", 51).unwrap(), Since::Nothing);
    }

    #[test]
    fn expire_drops_leading_records() {
        let dir = tempdir().unwrap();
        let mut times = seeded(dir.path());

        assert_eq!(times.expire("g", 2).unwrap(), 2);

        let serials: Vec<u32> = times
            .records("g")
            .unwrap()
            .iter()
            .map(TimesRecord::serial)
            .collect();
        assert_eq!(serials, vec![2, 3]);
        assert_eq!(times.since("g", 150).unwrap(), Since::Everything);
        assert!(!dir.path().join("g").join(TIMES_TMP_FILE_NAME).exists());

        assert_eq!(times.expire("g", 0).unwrap(), 0);
    }

    #[test]
    fn appends_after_expire_land_in_the_new_log() {
        let dir = tempdir().unwrap();
        let mut times = seeded(dir.path());
        let mut other = index(dir.path());
        assert_eq!(other.records("g").unwrap().len(), 4);

        times.expire("g", 3).unwrap();
        other.append_at("g", 4, 400).unwrap();

        let serials: Vec<u32> = times
            .records("g")
            .unwrap()
            .iter()
            .map(TimesRecord::serial)
            .collect();
        assert_eq!(serials, vec![3, 4]);
    }

    #[test]
    fn partial_trailing_record_is_ignored() {
        let dir = tempdir().unwrap();
        let mut times = seeded(dir.path());
        times.close();

        let path = dir.path().join("g").join(TIMES_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();

        assert_eq!(times.records("g").unwrap().len(), 4);
        assert_eq!(times.since("g", 1000).unwrap(), Since::Nothing);
    }

    #[test]
    fn append_after_a_torn_record_stays_aligned() {
        let dir = tempdir().unwrap();
        let mut times = seeded(dir.path());

        let path = dir.path().join("g").join(TIMES_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 9, 9, 9, 9]).unwrap();

        times.append_at("g", 4, 400).unwrap();

        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            5 * TIMES_RECORD_SIZE as u64
        );
        let records = times.records("g").unwrap();
        assert_eq!((records[4].serial(), records[4].stored_at()), (4, 400));
        assert_eq!(times.since("g", 350).unwrap(), Since::Boundary(3));
    }

    #[test]
    fn read_only_index_reads_but_does_not_write() {
        let dir = tempdir().unwrap();
        drop(seeded(dir.path()));
        let access = AccessOptions {
            read_only: true,
            ..AccessOptions::default()
        };
        let mut times = TimesIndex::open(dir.path(), access, 3).unwrap();

        assert_eq!(times.since("g", 250).unwrap(), Since::Boundary(2));
        assert_eq!(times.since("other", 250).unwrap(), Since::Nothing);
        assert!(matches!(
            StoreError::of(&times.append_at("g", 9, 900).unwrap_err()),
            Some(StoreError::ReadOnly { .. })
        ));
    }
}
