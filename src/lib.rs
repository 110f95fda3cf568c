//! # newsspool - Shared On-Disk Article Spool
//!
//! newsspool is the storage layer of a Usenet news server. It stores
//! articles per newsgroup, maps message-IDs to where they are stored and
//! records when each article arrived. There is no server process: the NNTP
//! daemon, fetchers, posting tools and expiry all open the same files and
//! coordinate through advisory locks, while readers never lock at all.
//!
//! ## Quick Start
//!
//! ```ignore
//! use newsspool::Spool;
//!
//! let mut spool = Spool::builder()
//!     .root("/var/spool/news")
//!     .open()?;
//!
//! let serial = spool.post("comp.lang.rust", "<a@example.org>", head, body)?;
//! let entry = spool.find("<a@example.org>")?;
//! let article = spool.fetch(&entry.group, entry.serial)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Spool (facade)                │
//! ├───────────────┬──────────────┬───────────────┤
//! │ Disk Hash     │ Article      │ Temporal      │
//! │ Index         │ Archive      │ Index         │
//! ├───────┬───────┼──────────────┴───────────────┤
//! │ Arena │ Group │         Object Cache         │
//! │       │ Table │                              │
//! ├───────┴───────┴──────────────────────────────┤
//! │   Storage: mappings, locks, on-disk headers   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! root/
//! ├── .chain              # arena holding hash chain nodes
//! ├── .table              # hash buckets
//! ├── .newsgroup          # "id name" lines
//! └── comp.lang.rust/
//!     ├── 0               # article file, serials 0..K-1
//!     ├── 1               # serials K..2K-1
//!     └── .times          # (serial, arrival time) log
//! ```
//!
//! ## Module Overview
//!
//! - [`arena`]: file-backed size-class allocator with integer handles
//! - [`newsgroup`]: newsgroup name interning
//! - [`dhash`]: message-ID hash index
//! - [`cache`]: bounded MRU object cache
//! - [`archive`]: article files, compaction, aliases
//! - [`times`]: arrival logs and cutoff queries
//! - [`spool`]: everything above opened on one root
//! - [`storage`]: mappings, locks and on-disk headers shared by the above

pub mod archive;
pub mod arena;
pub mod cache;
pub mod config;
pub mod dhash;
pub mod error;
pub mod newsgroup;
pub mod spool;
pub mod storage;
pub mod times;

pub use archive::ArticleView;
pub use config::SpoolConfig;
pub use dhash::IndexEntry;
pub use error::StoreError;
pub use spool::{ExpireReport, Spool, SpoolBuilder};
pub use times::Since;
