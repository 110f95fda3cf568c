//! # Spool Errors
//!
//! Every fallible operation in this crate returns `eyre::Result`. Failures
//! that callers need to tell apart (a missing message-ID versus a duplicate
//! insert versus a lock that could not be taken) are raised as a typed
//! [`StoreError`] through `eyre::bail!`, so they travel inside the report
//! and can be recovered with a downcast:
//!
//! ```ignore
//! match spool.find("<a@x>") {
//!     Ok(entry) => { /* ... */ }
//!     Err(report) if StoreError::of(&report).is_some_and(StoreError::is_not_found) => {
//!         /* 430 no such article */
//!     }
//!     Err(report) => return Err(report),
//! }
//! ```
//!
//! Plain I/O failures are not wrapped in `StoreError`; they keep the OS
//! error as their source and carry the file path and operation as eyre
//! context.
//!
//! ## Taxonomy
//!
//! | Variant          | Meaning                                              |
//! |------------------|------------------------------------------------------|
//! | `NotFound`       | missing message-ID, empty slot, missing file         |
//! | `Cancelled`      | slot was tombstoned by a cancel                      |
//! | `Duplicate`      | message-ID already indexed                           |
//! | `Corrupt`        | bad magic, malformed slot, handle out of bounds      |
//! | `ChunkTooLarge`  | allocation above the largest size class              |
//! | `GroupTableFull` | no more 16-bit newsgroup ids                         |
//! | `TooManyAliases` | alias chain longer than the hop limit                |
//! | `LockTimeout`    | advisory lock still contended after every retry      |
//! | `ReadOnly`       | mutation attempted on a read-only spool              |
//! | `InvalidGroupName` | group name unusable as a directory / alias token   |
//! | `MessageIdMismatch` | head's `Message-ID` differs from the posted one   |

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound { what: String },
    Cancelled { group: String, serial: u32 },
    Duplicate { message_id: String },
    Corrupt { path: PathBuf, detail: String },
    ChunkTooLarge { requested: usize, max: usize },
    GroupTableFull { highest: u32 },
    TooManyAliases { group: String, serial: u32 },
    LockTimeout { path: PathBuf, attempts: u32 },
    ReadOnly { path: PathBuf },
    InvalidGroupName { name: String },
    MessageIdMismatch { message_id: String, found: Option<String> },
}

impl StoreError {
    pub fn of(report: &eyre::Report) -> Option<&StoreError> {
        report.downcast_ref::<StoreError>()
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// True for every flavour of "the article is not there", including
    /// cancelled slots and unresolvable aliases.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. }
                | StoreError::Cancelled { .. }
                | StoreError::TooManyAliases { .. }
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { what } => write!(f, "not found: {}", what),
            StoreError::Cancelled { group, serial } => {
                write!(f, "article {}:{} has been cancelled", group, serial)
            }
            StoreError::Duplicate { message_id } => {
                write!(f, "message-id {} is already indexed", message_id)
            }
            StoreError::Corrupt { path, detail } => {
                write!(f, "corruption in '{}': {}", path.display(), detail)
            }
            StoreError::ChunkTooLarge { requested, max } => write!(
                f,
                "allocation of {} bytes exceeds the largest size class ({} bytes)",
                requested, max
            ),
            StoreError::GroupTableFull { highest } => {
                write!(f, "newsgroup table is full (highest id {})", highest)
            }
            StoreError::TooManyAliases { group, serial } => {
                write!(f, "too many aliases under {}:{}", group, serial)
            }
            StoreError::LockTimeout { path, attempts } => write!(
                f,
                "could not lock '{}' after {} attempts",
                path.display(),
                attempts
            ),
            StoreError::ReadOnly { path } => {
                write!(f, "'{}' is open read-only", path.display())
            }
            StoreError::InvalidGroupName { name } => {
                write!(f, "invalid newsgroup name {:?}", name)
            }
            StoreError::MessageIdMismatch { message_id, found: Some(found) } => write!(
                f,
                "head carries Message-ID {} but the article was posted as {}",
                found, message_id
            ),
            StoreError::MessageIdMismatch { message_id, found: None } => {
                write!(f, "head of {} has no Message-ID header", message_id)
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::bail;

    fn fails() -> eyre::Result<()> {
        bail!(StoreError::Duplicate {
            message_id: "<a@x>".to_string()
        })
    }

    #[test]
    fn typed_error_survives_eyre_report() {
        let report = fails().unwrap_err();

        assert_eq!(
            StoreError::of(&report),
            Some(&StoreError::Duplicate {
                message_id: "<a@x>".to_string()
            })
        );
        assert!(report.to_string().contains("already indexed"));
    }

    #[test]
    fn cancelled_counts_as_not_found() {
        let err = StoreError::Cancelled {
            group: "g".to_string(),
            serial: 3,
        };

        assert!(err.is_not_found());
        assert!(!StoreError::corrupt("x", "y").is_not_found());
    }

    #[test]
    fn untyped_report_has_no_store_error() {
        let report = eyre::eyre!("disk on fire");

        assert!(StoreError::of(&report).is_none());
    }
}
