//! # Spool
//!
//! A `Spool` is one storage root with every component opened on it: the
//! message-ID index (with its arena and newsgroup table), the article
//! archive and the temporal index. It owns their caches, so two spools
//! opened on the same root share nothing in memory and coordinate only
//! through the files and their advisory locks, exactly like two processes.
//!
//! ## Posting
//!
//! ```text
//! post(group, <id>, head, body)
//!   0. <id> is indexable, not yet indexed, and is the head's Message-ID
//!   1. archive.store(group, head, body)    -> serial
//!   2. times.append(group, serial)         (serial, now)
//!   3. index.insert(<id>, group, serial)
//! ```
//!
//! The steps are not one transaction. A failure after step 1 leaves a
//! stored article that is reachable by `(group, serial)` but not by
//! message-ID; it is logged and the error is returned.
//!
//! A cross-post is stored once, in the first group. Every other group gets
//! an alias record pointing at it and the index maps the message-ID to the
//! primary copy.
//!
//! ## Cancelling
//!
//! A cancel reads the article's `Message-ID` header, tombstones the slot
//! and removes the index entry if it still points at this slot.
//!
//! ## Lifecycle
//!
//! `close()` syncs the index files and drops every cached handle. `Drop`
//! does the same for spools that were not closed explicitly. Any operation
//! on a closed spool fails.

mod builder;
mod expire;

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::{debug, warn};

use crate::archive::{header_field, is_alias, parse_alias, Archive, ArticleView};
use crate::cache::{CacheId, CacheStats};
use crate::config::SpoolConfig;
use crate::dhash::{is_indexable, DiskHash, IndexEntry};
use crate::error::StoreError;
use crate::times::{Since, TimesIndex};

pub use builder::SpoolBuilder;
pub use expire::ExpireReport;

#[derive(Debug)]
pub struct Spool {
    config: SpoolConfig,
    index: DiskHash,
    archive: Archive,
    times: TimesIndex,
    closed: bool,
}

impl Spool {
    pub fn builder() -> SpoolBuilder {
        SpoolBuilder::new()
    }

    /// Opens (creating if needed) a spool with default settings.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::builder().root(root).open()
    }

    pub fn with_config(config: SpoolConfig) -> Result<Self> {
        config.validate()?;
        if !config.access.read_only {
            fs::create_dir_all(&config.root).wrap_err_with(|| {
                format!("failed to create spool root '{}'", config.root.display())
            })?;
        }

        let index = DiskHash::open(&config.root, config.hash_buckets, config.access)?;
        let archive = Archive::open(&config)?;
        let times = TimesIndex::open(&config.root, config.access, config.times_cache_capacity)?;

        debug!(
            root = %config.root.display(),
            read_only = config.access.read_only,
            buckets = index.bucket_count(),
            "opened spool"
        );
        Ok(Self {
            config,
            index,
            archive,
            times,
            closed: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    pub fn index(&mut self) -> &mut DiskHash {
        &mut self.index
    }

    pub fn archive(&mut self) -> &mut Archive {
        &mut self.archive
    }

    pub fn times(&mut self) -> &mut TimesIndex {
        &mut self.times
    }

    /// Stores an article, records its arrival time and indexes its
    /// message-ID. Returns the serial.
    pub fn post(&mut self, group: &str, message_id: &str, head: &[u8], body: &[u8]) -> Result<u32> {
        self.check_new_message_id(message_id, head)?;

        let serial = self.archive.store(group, head, body)?;
        self.record_location(group, message_id, serial)?;
        Ok(serial)
    }

    /// Stores an article once in `groups[0]` and aliases it from every
    /// other group. Returns `(group, serial)` for each group in order.
    pub fn crosspost(
        &mut self,
        groups: &[&str],
        message_id: &str,
        head: &[u8],
        body: &[u8],
    ) -> Result<Vec<(String, u32)>> {
        let Some((&primary, others)) = groups.split_first() else {
            bail!("crosspost needs at least one group");
        };
        ensure!(
            !body.is_empty(),
            "cross-posted article {} has an empty body",
            message_id
        );
        self.check_new_message_id(message_id, head)?;

        let serial = self.archive.store(primary, head, body)?;
        self.record_location(primary, message_id, serial)?;

        let mut placed = vec![(primary.to_string(), serial)];
        for &group in others {
            let alias = self
                .archive
                .store_alias(group, primary, serial, message_id)?;
            self.times.append(group, alias)?;
            placed.push((group.to_string(), alias));
        }
        Ok(placed)
    }

    /// Cancel and expiry find the index entry through the stored head, so
    /// the head must carry the message-ID the article is indexed under.
    fn check_new_message_id(&mut self, message_id: &str, head: &[u8]) -> Result<()> {
        self.ensure_open()?;
        ensure!(
            is_indexable(message_id.as_bytes()),
            "message-id {:?} cannot be indexed",
            message_id
        );
        let found = header_field(head, "Message-ID");
        if found != Some(message_id.as_bytes()) {
            bail!(StoreError::MessageIdMismatch {
                message_id: message_id.to_string(),
                found: found.map(|id| String::from_utf8_lossy(id).into_owned()),
            });
        }
        match self.index.find(message_id) {
            Ok(_) => bail!(StoreError::Duplicate {
                message_id: message_id.to_string()
            }),
            Err(err) if StoreError::of(&err).is_some_and(StoreError::is_not_found) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn record_location(&mut self, group: &str, message_id: &str, serial: u32) -> Result<()> {
        if let Err(err) = self.times.append(group, serial) {
            warn!(group, serial, %err, "stored article has no arrival time");
            return Err(err);
        }
        if let Err(err) = self.index.insert(message_id, group, serial) {
            warn!(group, serial, message_id, %err, "stored article is not indexed");
            return Err(err);
        }
        Ok(())
    }

    pub fn find(&mut self, message_id: &str) -> Result<IndexEntry> {
        self.ensure_open()?;
        self.index.find(message_id)
    }

    pub fn fetch(&mut self, group: &str, serial: u32) -> Result<ArticleView<'_>> {
        self.ensure_open()?;
        self.archive.fetch(group, serial)
    }

    pub fn fetch_raw(&mut self, group: &str, serial: u32) -> Result<ArticleView<'_>> {
        self.ensure_open()?;
        self.archive.fetch_raw(group, serial)
    }

    pub fn article_by_id(&mut self, message_id: &str) -> Result<ArticleView<'_>> {
        let entry = self.find(message_id)?;
        self.archive.fetch(&entry.group, entry.serial)
    }

    /// Cancels `group:serial` and drops its index entry. Cancelling an
    /// alias only tombstones the alias.
    pub fn cancel(&mut self, group: &str, serial: u32) -> Result<()> {
        self.ensure_open()?;

        let message_id = {
            let view = self.archive.fetch_raw(group, serial)?;
            if is_alias(view.head, view.body) {
                None
            } else {
                view.message_id()
            }
        };

        self.archive.cancel(group, serial)?;

        let Some(message_id) = message_id else {
            return Ok(());
        };
        self.unindex(&message_id, group, serial)?;
        debug!(group, serial, message_id = %message_id, "cancelled article");
        Ok(())
    }

    /// Deletes the index entry for `message_id` if it points at
    /// `group:serial`. Returns whether it did.
    fn unindex(&mut self, message_id: &str, group: &str, serial: u32) -> Result<bool> {
        let entry = match self.index.find(message_id) {
            Ok(entry) => entry,
            Err(err) if StoreError::of(&err).is_some_and(StoreError::is_not_found) => {
                return Ok(false)
            }
            Err(err) => return Err(err),
        };
        if entry.group != group || entry.serial != serial {
            return Ok(false);
        }
        self.index.delete(message_id)?;
        Ok(true)
    }

    pub fn since(&mut self, group: &str, cutoff: u64) -> Result<Since> {
        self.ensure_open()?;
        self.times.since(group, cutoff)
    }

    pub fn group_range(&mut self, group: &str) -> Result<Option<(u32, u32)>> {
        self.ensure_open()?;
        self.archive.group_range(group)
    }

    /// Every interned newsgroup, in id order.
    pub fn groups(&mut self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let table = self.index.groups();
        table.reload()?;
        Ok(table.iter().map(|(_, name)| name.to_string()).collect())
    }

    pub fn cache_stats(&self) -> [(CacheId, CacheStats); 3] {
        [
            (CacheId::ARTICLE_MAPS, self.archive.map_stats()),
            (CacheId::STORE_FILES, self.archive.store_stats()),
            (CacheId::TIME_LOGS, self.times.stats()),
        ]
    }

    /// Target of an alias record, if `head`/`body` is one.
    pub fn alias_target(head: &[u8], body: &[u8]) -> Option<(String, u32)> {
        if is_alias(head, body) {
            parse_alias(head)
        } else {
            None
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.archive.close();
        self.times.close();
        if !self.config.access.read_only {
            self.index.sync()?;
        }
        debug!(root = %self.config.root.display(), "closed spool");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(
            !self.closed,
            "spool '{}' is closed",
            self.config.root.display()
        );
        Ok(())
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(root = %self.config.root.display(), %err, "failed to close spool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spool(root: &Path) -> Spool {
        Spool::builder()
            .root(root)
            .articles_per_file(4)
            .hash_buckets(64)
            .open()
            .unwrap()
    }

    fn not_found(err: &eyre::Report) -> bool {
        StoreError::of(err).is_some_and(StoreError::is_not_found)
    }

    const HEAD: &[u8] = b"From: a@example.org\r\nMessage-ID: <a@x>\r\nSubject: hi\r\n";

    #[test]
    fn post_find_fetch_cancel() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());

        let serial = spool.post("g", "<a@x>", HEAD, b"hello\r\n").unwrap();
        assert_eq!(serial, 0);

        assert_eq!(
            spool.find("<a@x>").unwrap(),
            IndexEntry {
                group: "g".to_string(),
                serial: 0
            }
        );
        let view = spool.fetch("g", 0).unwrap();
        assert_eq!(view.head, HEAD);
        assert_eq!(view.body, b"hello\r\n");

        assert_eq!(spool.article_by_id("<a@x>").unwrap().body, b"hello\r\n");
        assert_eq!(spool.times().records("g").unwrap().len(), 1);

        spool.cancel("g", 0).unwrap();

        assert!(not_found(&spool.find("<a@x>").unwrap_err()));
        assert!(not_found(&spool.fetch("g", 0).unwrap_err()));
    }

    #[test]
    fn empty_body_article_is_fetched_not_followed() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());
        let head: &[u8] = b"Message-ID: <e@x>\r\nSubject: empty body\r\n";

        spool.post("g", "<e@x>", head, b"").unwrap();

        {
            let view = spool.fetch("g", 0).unwrap();
            assert_eq!(view.head, head);
            assert!(view.body.is_empty());
        }
        assert_eq!(spool.article_by_id("<e@x>").unwrap().serial, 0);

        spool.cancel("g", 0).unwrap();
        assert!(not_found(&spool.find("<e@x>").unwrap_err()));
    }

    #[test]
    fn head_must_carry_the_posted_message_id() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());

        let heads: [&[u8]; 2] = [b"Subject: a\r\n", b"Message-ID: <b@x>\r\nSubject: a\r\n"];
        for head in heads {
            let err = spool.post("g", "<a@x>", head, b"A").unwrap_err();
            assert!(matches!(
                StoreError::of(&err),
                Some(StoreError::MessageIdMismatch { .. })
            ));
        }
        assert_eq!(spool.group_range("g").unwrap(), None);
    }

    #[test]
    fn cancelled_message_id_can_be_posted_again() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());

        spool.post("g", "<a@x>", HEAD, b"A").unwrap();
        spool.cancel("g", 0).unwrap();

        assert!(not_found(&spool.find("<a@x>").unwrap_err()));
        assert_eq!(spool.post("g", "<a@x>", HEAD, b"again").unwrap(), 1);
        assert_eq!(spool.article_by_id("<a@x>").unwrap().body, b"again");
    }

    #[test]
    fn duplicate_post_stores_nothing() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());

        spool.post("g", "<a@x>", HEAD, b"one").unwrap();
        let err = spool.post("g", "<a@x>", HEAD, b"two").unwrap_err();

        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Duplicate { .. })
        ));
        assert_eq!(spool.group_range("g").unwrap(), Some((0, 0)));
    }

    #[test]
    fn crosspost_stores_once_and_aliases() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());

        let placed = spool
            .crosspost(&["comp.a", "comp.b", "comp.c"], "<a@x>", HEAD, b"body")
            .unwrap();
        assert_eq!(
            placed,
            vec![
                ("comp.a".to_string(), 0),
                ("comp.b".to_string(), 0),
                ("comp.c".to_string(), 0)
            ]
        );

        let view = spool.fetch("comp.c", 0).unwrap();
        assert_eq!(view.group, "comp.a");
        assert_eq!(view.body, b"body");

        let raw = spool.fetch_raw("comp.b", 0).unwrap();
        assert_eq!(
            Spool::alias_target(raw.head, raw.body),
            Some(("comp.a".to_string(), 0))
        );

        assert_eq!(spool.find("<a@x>").unwrap().group, "comp.a");
        assert_eq!(spool.groups().unwrap(), vec!["comp.a".to_string()]);
    }

    #[test]
    fn cancelling_an_alias_keeps_the_index_entry() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());
        spool
            .crosspost(&["comp.a", "comp.b"], "<a@x>", HEAD, b"body")
            .unwrap();

        spool.cancel("comp.b", 0).unwrap();

        assert!(not_found(&spool.fetch("comp.b", 0).unwrap_err()));
        assert_eq!(spool.find("<a@x>").unwrap().group, "comp.a");
        assert_eq!(spool.fetch("comp.a", 0).unwrap().body, b"body");
    }

    #[test]
    fn unindexable_message_id_is_refused_before_storing() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());
        let long = format!("<{}@x>", "a".repeat(300));

        assert!(spool.post("g", &long, HEAD, b"b").is_err());
        assert!(spool.post("g", "", HEAD, b"b").is_err());
        assert_eq!(spool.group_range("g").unwrap(), None);
    }

    #[test]
    fn closed_spool_refuses_work() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());
        spool.post("g", "<a@x>", HEAD, b"b").unwrap();

        spool.close().unwrap();
        spool.close().unwrap();

        assert!(spool.is_closed());
        assert!(spool.find("<a@x>").unwrap_err().to_string().contains("closed"));
    }

    #[test]
    fn cache_stats_are_reported_per_cache() {
        let dir = tempdir().unwrap();
        let mut spool = spool(dir.path());
        spool.post("g", "<a@x>", HEAD, b"b").unwrap();
        spool.fetch("g", 0).unwrap();
        spool.fetch("g", 0).unwrap();

        let stats = spool.cache_stats();
        assert_eq!(stats[0].0, CacheId::ARTICLE_MAPS);
        assert_eq!(stats[0].1.hits, 1);
        assert_eq!(stats[0].1.misses, 1);
        assert_eq!(stats[2].0, CacheId::TIME_LOGS);
    }
}
