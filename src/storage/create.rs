//! Race-free creation of files that must never be observed half-written.
//!
//! A new arena, hash table or article file is written in full to a private
//! temporary file next to its final path, synced, and then hard-linked into
//! place. `link(2)` fails with `EEXIST` if another process got there first,
//! in which case the loser discards its copy and opens the winner's file.
//! Either way, no process ever maps a file whose header is still being
//! written.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Creates `path` with exactly `contents` unless it already exists.
/// Returns true if this call created it.
pub fn create_new_atomically(path: &Path, contents: &[u8]) -> Result<bool> {
    let tmp = temp_path_for(path);

    let result = write_and_link(&tmp, path, contents);
    let _ = fs::remove_file(&tmp);

    let created = result?;
    if !created {
        debug!(path = %path.display(), "lost creation race, using existing file");
    }
    Ok(created)
}

fn write_and_link(tmp: &Path, path: &Path, contents: &[u8]) -> Result<bool> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(tmp)
        .wrap_err_with(|| format!("failed to create temporary file '{}'", tmp.display()))?;
    file.write_all(contents)
        .wrap_err_with(|| format!("failed to write '{}'", tmp.display()))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to sync '{}'", tmp.display()))?;
    drop(file);

    match fs::hard_link(tmp, path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).wrap_err_with(|| {
            format!(
                "failed to link '{}' to '{}'",
                tmp.display(),
                path.display()
            )
        }),
    }
}

/// Opens `path` read-write (or read-only), creating it from `initial` first
/// if it does not exist yet.
pub fn open_or_create(path: &Path, initial: &[u8], read_only: bool) -> Result<File> {
    if !read_only && !path.exists() {
        create_new_atomically(path, initial)?;
    }

    OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
        .wrap_err_with(|| format!("failed to open '{}'", path.display()))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);

    path.with_file_name(format!(
        ".{}.{}.{}.{}.new",
        name.trim_start_matches('.'),
        std::process::id(),
        nanos,
        seq
    ))
}
