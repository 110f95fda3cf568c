//! # Object Cache
//!
//! A small bounded cache of expensive-to-build objects (open and mapped
//! article files, writable store handles, time logs). Each spool owns
//! several independent instances, told apart by a [`CacheId`].
//!
//! ## Structure
//!
//! Entries are preallocated when the cache is created and never freed
//! until it is dropped. They form an intrusive doubly linked list in MRU
//! order, linked by index rather than by pointer; unused entries sit on a
//! singly linked free list.
//!
//! ```text
//!  head (MRU)                              tail (LRU)
//!     │                                        │
//!     v                                        v
//!   [ 3 ] <──> [ 0 ] <──> [ 4 ] <──> [ 1 ]
//!
//!   free: [ 2 ] ──> [ 5 ] ──> NIL
//! ```
//!
//! Lookups scan from MRU to LRU. Capacities are single digits, so a linear
//! scan beats hashing, and it lets the cached type decide what "matching"
//! means through [`Cacheable::matches`].
//!
//! ## Staleness and Retirement
//!
//! A cached object may report itself stale, for example a mapping whose
//! file has since been replaced by compaction. Stale entries are evicted as
//! the scan passes over them. Every eviction, whether for staleness,
//! capacity, invalidation or shutdown, hands the object to
//! [`Cacheable::retire`] before the slot is reused.

use std::fmt;

use eyre::{ensure, Result};

use crate::config::MIN_CACHE_CAPACITY;

/// Identifies one cache instance inside a spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId(u8);

impl CacheId {
    pub const ARTICLE_MAPS: CacheId = CacheId(0);
    pub const STORE_FILES: CacheId = CacheId(1);
    pub const TIME_LOGS: CacheId = CacheId(2);

    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CacheId::ARTICLE_MAPS => f.write_str("article-maps"),
            CacheId::STORE_FILES => f.write_str("store-files"),
            CacheId::TIME_LOGS => f.write_str("time-logs"),
            CacheId(other) => write!(f, "cache-{}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub trait Cacheable {
    type Key: ?Sized;

    fn matches(&self, key: &Self::Key) -> bool;

    fn is_stale(&self) -> bool {
        false
    }

    /// Called exactly once when the object leaves the cache.
    fn retire(self)
    where
        Self: Sized,
    {
    }
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Entry<T> {
    value: Option<T>,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub struct ObjectCache<T: Cacheable> {
    id: CacheId,
    entries: Vec<Entry<T>>,
    head: usize,
    tail: usize,
    free: usize,
    len: usize,
    stats: CacheStats,
}

impl<T: Cacheable> ObjectCache<T> {
    pub fn new(id: CacheId, capacity: usize) -> Result<Self> {
        ensure!(
            capacity >= MIN_CACHE_CAPACITY,
            "cache {} needs at least {} entries (got {})",
            id,
            MIN_CACHE_CAPACITY,
            capacity
        );

        let entries = (0..capacity)
            .map(|i| Entry {
                value: None,
                prev: NIL,
                next: if i + 1 < capacity { i + 1 } else { NIL },
            })
            .collect();

        Ok(Self {
            id,
            entries,
            head: NIL,
            tail: NIL,
            free: 0,
            len: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn id(&self) -> CacheId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Returns the first live match, promoting it to most recently used.
    pub fn find(&mut self, key: &T::Key) -> Option<&mut T> {
        let mut cursor = self.head;
        let mut found = NIL;

        while cursor != NIL {
            let next = self.entries[cursor].next;
            let (stale, hit) = match &self.entries[cursor].value {
                Some(value) if value.is_stale() => (true, false),
                Some(value) => (false, value.matches(key)),
                None => (false, false),
            };
            if stale {
                self.evict(cursor);
            } else if hit {
                found = cursor;
                break;
            }
            cursor = next;
        }

        if found == NIL {
            self.stats.misses += 1;
            return None;
        }
        self.stats.hits += 1;
        self.unlink(found);
        self.push_front(found);
        self.entries[found].value.as_mut()
    }

    /// Adds `value` as most recently used, evicting the least recently used
    /// entry if the cache is full. Does not check for an existing match.
    pub fn insert(&mut self, value: T) -> &mut T {
        if self.free == NIL {
            self.evict(self.tail);
        }

        let slot = self.free;
        self.free = self.entries[slot].next;
        self.push_front(slot);
        self.len += 1;

        self.entries[slot].value.insert(value)
    }

    /// Evicts the first entry matching `key`. Returns whether one existed.
    pub fn invalidate(&mut self, key: &T::Key) -> bool {
        let mut cursor = self.head;
        while cursor != NIL {
            let hit = self.entries[cursor]
                .value
                .as_ref()
                .is_some_and(|value| value.matches(key));
            if hit {
                self.evict(cursor);
                return true;
            }
            cursor = self.entries[cursor].next;
        }
        false
    }

    /// Most recently used object, without touching the order or the stats.
    pub fn top(&mut self) -> Option<&mut T> {
        if self.head == NIL {
            return None;
        }
        self.entries[self.head].value.as_mut()
    }

    /// Retires every entry.
    pub fn clear(&mut self) {
        while self.head != NIL {
            self.evict(self.head);
        }
    }

    fn evict(&mut self, slot: usize) {
        if slot == NIL {
            return;
        }
        self.unlink(slot);
        let value = self.entries[slot].value.take();
        self.entries[slot].next = self.free;
        self.free = slot;
        self.len -= 1;

        if let Some(value) = value {
            value.retire();
        }
    }

    fn unlink(&mut self, slot: usize) {
        let Entry { prev, next, .. } = self.entries[slot];
        if prev == NIL {
            self.head = next;
        } else {
            self.entries[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entries[next].prev = prev;
        }
        self.entries[slot].prev = NIL;
        self.entries[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.entries[slot].prev = NIL;
        self.entries[slot].next = self.head;
        if self.head != NIL {
            self.entries[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

impl<T: Cacheable> Drop for ObjectCache<T> {
    fn drop(&mut self) {
        self.clear();
    }
}
