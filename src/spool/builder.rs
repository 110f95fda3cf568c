//! # Spool Builder
//!
//! `SpoolBuilder` collects the runtime settings of a spool before opening
//! it. Anything left unset takes its default from `config::constants`.
//!
//! | Option               | Default | Description                              |
//! |----------------------|---------|------------------------------------------|
//! | articles_per_file    | 10      | slots per article file (fixed per root)  |
//! | hash_buckets         | 10240   | buckets of a newly created hash table    |
//! | read_only            | false   | refuse every mutation                    |
//! | lock_attempts        | 100     | advisory lock retries before giving up   |
//! | lock_backoff         | 2ms     | first retry delay, doubled up to 50ms    |
//! | article_cache        | 8       | read-only article mappings kept open     |
//! | store_cache          | 8       | writable article files kept open         |
//! | times_cache          | 3       | time logs kept open                      |
//!
//! ```ignore
//! let spool = Spool::builder()
//!     .root("/var/spool/news")
//!     .read_only(true)
//!     .open()?;
//! ```
//!
//! `articles_per_file` is not recorded on disk. Every process sharing a
//! root must use the same value, or serials will resolve to the wrong slot.

use std::path::PathBuf;
use std::time::Duration;

use eyre::Result;

use crate::config::SpoolConfig;

use super::Spool;

#[derive(Debug, Clone, Default)]
pub struct SpoolBuilder {
    root: Option<PathBuf>,
    articles_per_file: Option<u32>,
    hash_buckets: Option<u32>,
    read_only: Option<bool>,
    lock_attempts: Option<u32>,
    lock_backoff: Option<Duration>,
    article_cache: Option<usize>,
    store_cache: Option<usize>,
    times_cache: Option<usize>,
}

impl SpoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage root. Created on open unless the spool is read-only.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn articles_per_file(mut self, slots: u32) -> Self {
        self.articles_per_file = Some(slots);
        self
    }

    /// Only used when the hash table does not exist yet.
    pub fn hash_buckets(mut self, buckets: u32) -> Self {
        self.hash_buckets = Some(buckets);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = Some(attempts);
        self
    }

    pub fn lock_backoff(mut self, backoff: Duration) -> Self {
        self.lock_backoff = Some(backoff);
        self
    }

    pub fn article_cache(mut self, capacity: usize) -> Self {
        self.article_cache = Some(capacity);
        self
    }

    pub fn store_cache(mut self, capacity: usize) -> Self {
        self.store_cache = Some(capacity);
        self
    }

    pub fn times_cache(mut self, capacity: usize) -> Self {
        self.times_cache = Some(capacity);
        self
    }

    /// Resolves the settings into a validated configuration.
    pub fn config(&self) -> Result<SpoolConfig> {
        let root = self
            .root
            .clone()
            .ok_or_else(|| eyre::eyre!("storage root not specified: call .root() first"))?;

        let mut config = SpoolConfig::new(root);
        if let Some(slots) = self.articles_per_file {
            config.articles_per_file = slots;
        }
        if let Some(buckets) = self.hash_buckets {
            config.hash_buckets = buckets;
        }
        if let Some(read_only) = self.read_only {
            config.access.read_only = read_only;
        }
        if let Some(attempts) = self.lock_attempts {
            config.access.lock.attempts = attempts;
        }
        if let Some(backoff) = self.lock_backoff {
            config.access.lock.backoff = backoff;
            config.access.lock.max_backoff = config.access.lock.max_backoff.max(backoff);
        }
        if let Some(capacity) = self.article_cache {
            config.article_cache_capacity = capacity;
        }
        if let Some(capacity) = self.store_cache {
            config.store_cache_capacity = capacity;
        }
        if let Some(capacity) = self.times_cache {
            config.times_cache_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn open(self) -> Result<Spool> {
        Spool::with_config(self.config()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_ARTICLES_PER_FILE, DEFAULT_HASH_BUCKETS};
    use tempfile::tempdir;

    #[test]
    fn unset_options_take_defaults() {
        let config = SpoolBuilder::new().root("/tmp/spool").config().unwrap();

        assert_eq!(config.articles_per_file, DEFAULT_ARTICLES_PER_FILE);
        assert_eq!(config.hash_buckets, DEFAULT_HASH_BUCKETS);
        assert!(!config.access.read_only);
    }

    #[test]
    fn chained_options_are_applied() {
        let config = SpoolBuilder::new()
            .root("/tmp/spool")
            .articles_per_file(4)
            .hash_buckets(64)
            .read_only(true)
            .lock_attempts(3)
            .lock_backoff(Duration::from_millis(100))
            .article_cache(2)
            .store_cache(5)
            .times_cache(6)
            .config()
            .unwrap();

        assert_eq!(config.articles_per_file, 4);
        assert_eq!(config.hash_buckets, 64);
        assert!(config.access.read_only);
        assert_eq!(config.access.lock.attempts, 3);
        assert_eq!(config.access.lock.backoff, Duration::from_millis(100));
        assert_eq!(config.access.lock.max_backoff, Duration::from_millis(100));
        assert_eq!(config.article_cache_capacity, 2);
        assert_eq!(config.store_cache_capacity, 5);
        assert_eq!(config.times_cache_capacity, 6);
    }

    #[test]
    fn open_without_root_fails() {
        let err = SpoolBuilder::new().open().unwrap_err();

        assert!(err.to_string().contains("storage root not specified"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(SpoolBuilder::new()
            .root("/tmp/spool")
            .articles_per_file(1)
            .config()
            .is_err());
        assert!(SpoolBuilder::new()
            .root("/tmp/spool")
            .store_cache(1)
            .config()
            .is_err());
    }

    #[test]
    fn open_creates_the_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("spool");

        let spool = SpoolBuilder::new().root(&root).hash_buckets(16).open().unwrap();

        assert!(root.join(".table").exists());
        assert!(root.join(".chain").exists());
        drop(spool);
    }
}
