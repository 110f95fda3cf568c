//! # Advisory File Locks
//!
//! Every writer in the spool serializes through a whole-file advisory lock
//! on the file it mutates: the arena, the hash table, the newsgroup file and
//! each article file. Readers never lock.
//!
//! Locks are taken with `fs2` (flock semantics on Unix). Because flock locks
//! belong to the open file description, two independently opened handles to
//! the same file conflict even inside one process, which is what lets tests
//! run two `Spool` instances against one root and observe the same
//! exclusion that separate processes get.
//!
//! Acquisition never blocks indefinitely: a non-blocking attempt is retried
//! with exponential backoff up to the policy's attempt count, after which
//! `StoreError::LockTimeout` is raised. The guard releases the lock when
//! dropped, on every exit path. A lock held by a process that dies is
//! released by the kernel; the next locker simply proceeds.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use eyre::{bail, Result, WrapErr};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::config::LockPolicy;
use crate::error::StoreError;

#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks `file` exclusively. The guard keeps its own duplicate of the
    /// descriptor, so the caller stays free to use `file` mutably while the
    /// lock is held.
    pub fn acquire(file: &File, path: &Path, policy: &LockPolicy) -> Result<Self> {
        let file = file
            .try_clone()
            .wrap_err_with(|| format!("failed to duplicate handle for '{}'", path.display()))?;

        let mut backoff = policy.backoff;
        let mut attempt = 0;

        while attempt < policy.attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(path = %path.display(), attempt, "acquired contended lock");
                    }
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) if is_contended(&err) => {
                    attempt += 1;
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(policy.max_backoff);
                }
                Err(err) => {
                    return Err(err)
                        .wrap_err_with(|| format!("failed to lock '{}'", path.display()));
                }
            }
        }

        warn!(path = %path.display(), attempts = policy.attempts, "lock contention timeout");
        bail!(StoreError::LockTimeout {
            path: path.to_path_buf(),
            attempts: policy.attempts,
        })
    }

    /// Single attempt; `None` when another holder has the lock.
    pub fn try_acquire(file: &File, path: &Path) -> Result<Option<Self>> {
        let file = file
            .try_clone()
            .wrap_err_with(|| format!("failed to duplicate handle for '{}'", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err).wrap_err_with(|| format!("failed to lock '{}'", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), %err, "failed to release lock");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
