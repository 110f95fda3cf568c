//! # Spool Configuration
//!
//! Compile-time constants live in [`constants`], grouped by the component
//! whose on-disk format they describe. Values that depend on each other are
//! co-located and tied together with `const` assertions, so a change to the
//! arena's size classes cannot silently break the hash index's node layout.
//!
//! Runtime settings (storage root, slots per article file, bucket count,
//! lock retry policy, cache sizes) are carried by [`SpoolConfig`], which is
//! normally assembled through `Spool::builder()`.

pub mod constants;
pub use constants::*;

use std::path::PathBuf;
use std::time::Duration;

/// Bounded retry policy for advisory file locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_LOCK_ATTEMPTS,
            backoff: DEFAULT_LOCK_BACKOFF,
            max_backoff: MAX_LOCK_BACKOFF,
        }
    }
}

/// Options shared by every component that opens a file under the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessOptions {
    pub read_only: bool,
    pub lock: LockPolicy,
}

impl Default for AccessOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            lock: LockPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolConfig {
    pub root: PathBuf,
    pub articles_per_file: u32,
    pub hash_buckets: u32,
    pub access: AccessOptions,
    pub article_cache_capacity: usize,
    pub store_cache_capacity: usize,
    pub times_cache_capacity: usize,
}

impl SpoolConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            articles_per_file: DEFAULT_ARTICLES_PER_FILE,
            hash_buckets: DEFAULT_HASH_BUCKETS,
            access: AccessOptions::default(),
            article_cache_capacity: ARTICLE_CACHE_CAPACITY,
            store_cache_capacity: STORE_CACHE_CAPACITY,
            times_cache_capacity: TIMES_CACHE_CAPACITY,
        }
    }

    pub fn validate(&self) -> eyre::Result<()> {
        eyre::ensure!(
            (MIN_ARTICLES_PER_FILE..=MAX_ARTICLES_PER_FILE).contains(&self.articles_per_file),
            "articles per file must be between {} and {} (got {})",
            MIN_ARTICLES_PER_FILE,
            MAX_ARTICLES_PER_FILE,
            self.articles_per_file
        );
        eyre::ensure!(
            self.hash_buckets > 0 && self.hash_buckets <= MAX_HASH_BUCKETS,
            "hash bucket count must be between 1 and {} (got {})",
            MAX_HASH_BUCKETS,
            self.hash_buckets
        );
        eyre::ensure!(
            self.access.lock.attempts > 0,
            "lock policy needs at least one attempt"
        );
        for (name, capacity) in [
            ("article", self.article_cache_capacity),
            ("store", self.store_cache_capacity),
            ("times", self.times_cache_capacity),
        ] {
            eyre::ensure!(
                capacity >= MIN_CACHE_CAPACITY,
                "{} cache capacity {} is below the minimum of {}",
                name,
                capacity,
                MIN_CACHE_CAPACITY
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SpoolConfig::new("/tmp/spool").validate().unwrap();
    }

    #[test]
    fn single_slot_files_are_rejected() {
        let mut config = SpoolConfig::new("/tmp/spool");
        config.articles_per_file = 1;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("articles per file"));
    }

    #[test]
    fn tiny_cache_is_rejected() {
        let mut config = SpoolConfig::new("/tmp/spool");
        config.times_cache_capacity = 1;

        assert!(config.validate().is_err());
    }
}
