//! # Storage Module
//!
//! The low-level file machinery every spool component is built on: shared
//! memory mappings that follow growth by other processes, fixed-layout
//! on-disk records, advisory whole-file locks, and race-free file creation.
//!
//! ## Storage Root Layout
//!
//! ```text
//! root/
//! ├── .chain               # arena holding hash chain nodes
//! ├── .table               # hash index bucket heads
//! ├── .newsgroup           # "<id> <name>\n" interning log
//! ├── comp.lang.rust/
//! │   ├── .times           # (serial, stored-at) arrival log
//! │   ├── 0                # serials 0..K-1
//! │   ├── 1                # serials K..2K-1
//! │   └── +1               # compaction scratch file (transient)
//! └── alt.test/
//!     └── ...
//! ```
//!
//! ## Sharing Without a Server
//!
//! Every process opens the files directly. Writers serialize on
//! [`FileLock`]; readers never lock and instead rely on two rules:
//!
//! 1. Files only grow in place. Anything that must shrink or be reordered
//!    (compaction, time-log expiry) is rewritten into a new file that is
//!    renamed over the old one, so an existing mapping keeps showing a
//!    consistent, if stale, snapshot.
//! 2. A record becomes visible through one aligned 32-bit release store,
//!    issued only after the record itself is complete.
//!
//! ## Module Organization
//!
//! - `mmap`: growable shared mappings (`MappedFile`)
//! - `headers`: zerocopy record layouts and slot classification
//! - `lock`: retrying advisory lock guard (`FileLock`)
//! - `create`: temp-file plus hard-link creation

mod create;
mod headers;
mod lock;
mod mmap;

pub use create::{create_new_atomically, open_or_create};
pub use headers::{
    ArenaHeader, ArticleFileHeader, Slot, SlotState, TableHeader, TimesRecord,
    ARENA_FIXED_HEADER_SIZE,
};
pub use lock::FileLock;
pub use mmap::MappedFile;
