//! Compaction of a full article file.
//!
//! Articles are appended in arrival order, so a full file interleaves heads
//! and bodies. Once its last slot is used the file is rewritten with every
//! head first and every body after them, which keeps header scans (overview
//! building, expiry) inside a few contiguous pages:
//!
//! ```text
//! before:  [hdr|slots] h0 b0 h1 b1 h2 b2 ...
//! after:   [hdr|slots] h0 h1 h2 ... b0 b1 b2 ...
//! ```
//!
//! The rewrite goes to `<group>/+<n>`, created exclusively: if that file
//! already exists another process is compacting and this pass is skipped.
//! The original is try-locked so a concurrent cancel is not lost; if the
//! lock is busy the pass is abandoned and the file stays as it is, which is
//! still a valid file. Cancelled slots keep their tombstones and lengths but
//! lose their bytes. A corrupt slot aborts the pass. On success the new
//! file is synced and renamed over the original.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use eyre::{bail, Result, WrapErr};
use tracing::{debug, error, warn};
use zerocopy::IntoBytes;

use crate::config::COMPACT_PREFIX;
use crate::error::StoreError;
use crate::storage::{ArticleFileHeader, FileLock, Slot, SlotState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactOutcome {
    Compacted { live: u32, cancelled: u32 },
    /// Another process holds the scratch file or the original's lock.
    Skipped,
}

pub fn compact_file(dir: &Path, number: u32, slots: u32) -> Result<CompactOutcome> {
    let path = dir.join(number.to_string());
    let scratch = dir.join(format!("{}{}", COMPACT_PREFIX, number));

    let mut out = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&scratch)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "compaction already in progress");
            return Ok(CompactOutcome::Skipped);
        }
        Err(err) => {
            return Err(err)
                .wrap_err_with(|| format!("failed to create '{}'", scratch.display()))
        }
    };

    let result = rewrite(&path, &scratch, &mut out, slots);
    if !matches!(result, Ok(CompactOutcome::Compacted { .. })) {
        if let Err(err) = fs::remove_file(&scratch) {
            warn!(path = %scratch.display(), %err, "failed to remove compaction scratch file");
        }
    }
    result
}

fn rewrite(path: &Path, scratch: &Path, out: &mut File, slots: u32) -> Result<CompactOutcome> {
    let mut source = File::open(path)
        .wrap_err_with(|| format!("failed to open '{}' for compaction", path.display()))?;

    let Some(_lock) = FileLock::try_acquire(&source, path)? else {
        warn!(path = %path.display(), "article file busy, skipping compaction");
        return Ok(CompactOutcome::Skipped);
    };

    let mut bytes = Vec::new();
    source
        .read_to_end(&mut bytes)
        .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;

    let data_start = ArticleFileHeader::data_start(slots) as usize;
    if bytes.len() < data_start {
        bail!(StoreError::corrupt(path, "slot table is truncated"));
    }
    let found = ArticleFileHeader::from_bytes(&bytes)?.slot_count();
    if found != slots {
        bail!(StoreError::corrupt(
            path,
            format!("file has {} slots, expected {}", found, slots)
        ));
    }

    let old: Vec<Slot> = (0..slots as usize)
        .map(|i| {
            let at = ArticleFileHeader::slot_offset(i as u32) as usize;
            Slot::read(&bytes[at..]).wrap_err_with(|| format!("failed to parse slot {}", i))
        })
        .collect::<Result<_>>()?;

    let mut data = Vec::with_capacity(bytes.len() - data_start);
    let mut heads = vec![0u32; slots as usize];
    let (mut live, mut cancelled) = (0, 0);

    for (i, slot) in old.iter().enumerate() {
        match slot.state() {
            SlotState::Valid => {
                heads[i] = offset_of(data_start, data.len())?;
                data.extend_from_slice(piece(&bytes, path, slot.head_off(), slot.head_len())?);
                live += 1;
            }
            SlotState::Cancelled => cancelled += 1,
            SlotState::Empty => {}
            SlotState::Corrupt => {
                error!(path = %path.display(), slot = i, "corrupt slot, abandoning compaction");
                bail!(StoreError::corrupt(path, format!("slot {} is corrupt", i)));
            }
        }
    }

    let mut table = Vec::with_capacity(data_start);
    table.extend_from_slice(ArticleFileHeader::new(slots).as_bytes());

    for (i, slot) in old.iter().enumerate() {
        let new_slot = match slot.state() {
            SlotState::Valid => {
                let body_off = offset_of(data_start, data.len())?;
                data.extend_from_slice(piece(&bytes, path, slot.body_off(), slot.body_len())?);
                Slot::new(heads[i], slot.head_len(), body_off, slot.body_len())
            }
            SlotState::Cancelled => Slot::cancelled(slot.head_len(), slot.body_len()),
            _ => Slot::default(),
        };
        table.extend_from_slice(new_slot.as_bytes());
    }

    out.write_all(&table)
        .and_then(|_| out.write_all(&data))
        .and_then(|_| out.sync_all())
        .wrap_err_with(|| format!("failed to write compacted copy of '{}'", path.display()))?;
    fs::rename(scratch, path).wrap_err_with(|| {
        format!(
            "failed to rename '{}' over '{}'",
            scratch.display(),
            path.display()
        )
    })?;

    debug!(path = %path.display(), live, cancelled, "compacted article file");
    Ok(CompactOutcome::Compacted { live, cancelled })
}

/// One stored entity (head or body) including its zero sentinels.
fn piece<'a>(bytes: &'a [u8], path: &Path, off: u32, len: u32) -> Result<&'a [u8]> {
    let (start, end) = (off as usize, off as usize + len as usize);
    match bytes.get(start..end) {
        Some(piece) if piece.first() == Some(&0) => Ok(piece),
        _ => bail!(StoreError::corrupt(
            path,
            format!("slot range {}+{} is invalid", off, len)
        )),
    }
}

fn offset_of(data_start: usize, used: usize) -> Result<u32> {
    u32::try_from(data_start + used).wrap_err("compacted article file would exceed 4 GiB")
}
