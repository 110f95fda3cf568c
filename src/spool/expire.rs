//! # Expiry
//!
//! Articles are expired a whole article file at a time. The cutoff
//! `now - max_age` is located in the group's time log:
//!
//! | `since(cutoff)` | Files removed                                       |
//! |-----------------|-----------------------------------------------------|
//! | `Everything`    | none, every article is younger than the cutoff      |
//! | `Nothing`       | all but the highest-numbered file                   |
//! | `Boundary(s)`   | files below the one holding `s`, and that file too  |
//! |                 | when `s` is its last slot                           |
//!
//! The highest-numbered file is never removed: the next store continues
//! numbering from it, and removing it would hand out its serials again.
//!
//! For each file, index entries that still point into it are deleted
//! before the file is unlinked, so the index never points at a missing
//! file for longer than one expiry pass. Time records below the first
//! surviving serial are dropped last.

use eyre::Result;
use tracing::{debug, warn};

use crate::times::{unix_now, Since};

use super::Spool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireReport {
    pub files_removed: u32,
    pub index_entries_removed: u32,
    pub time_records_removed: u32,
}

impl Spool {
    /// Expires articles of `group` older than `max_age_secs`.
    pub fn expire(&mut self, group: &str, max_age_secs: u64) -> Result<ExpireReport> {
        let cutoff = unix_now().saturating_sub(max_age_secs);
        self.expire_before(group, cutoff)
    }

    /// Expires articles of `group` stored at or before `cutoff` (seconds
    /// since the epoch), at file granularity.
    pub fn expire_before(&mut self, group: &str, cutoff: u64) -> Result<ExpireReport> {
        self.ensure_open()?;
        let slots = self.archive.articles_per_file();
        let numbers = self.archive.file_numbers(group)?;
        let Some((&newest, older)) = numbers.split_last() else {
            return Ok(ExpireReport::default());
        };

        let doomed: Vec<u32> = match self.times.since(group, cutoff)? {
            Since::Everything => Vec::new(),
            Since::Nothing => older.to_vec(),
            Since::Boundary(serial) => {
                let file = serial / slots;
                let last_slot = serial % slots == slots - 1;
                older
                    .iter()
                    .copied()
                    .filter(|&n| n < file || (n == file && last_slot))
                    .collect()
            }
        };
        let Some(&highest) = doomed.last() else {
            debug!(group, cutoff, "nothing to expire");
            return Ok(ExpireReport::default());
        };
        debug_assert!(highest < newest);

        let mut report = ExpireReport::default();
        for number in doomed {
            report.index_entries_removed += self.unindex_file(group, number)?;
            if self.archive.remove_file(group, number)? {
                report.files_removed += 1;
            }
        }

        let until = (highest + 1).saturating_mul(slots);
        report.time_records_removed = self.times.expire(group, until)? as u32;

        debug!(
            group,
            files = report.files_removed,
            entries = report.index_entries_removed,
            records = report.time_records_removed,
            "expired articles"
        );
        Ok(report)
    }

    /// Deletes index entries that point at live articles in one file.
    fn unindex_file(&mut self, group: &str, number: u32) -> Result<u32> {
        let slots = self.archive.articles_per_file();
        let mut removed = 0;

        for index in self.archive.live_slots(group, number)? {
            let serial = number * slots + index;
            let message_id = match self.archive.fetch_raw(group, serial) {
                Ok(view) if Self::alias_target(view.head, view.body).is_some() => continue,
                Ok(view) => view.message_id(),
                Err(err) => {
                    warn!(group, serial, %err, "unreadable article during expiry");
                    continue;
                }
            };
            let Some(message_id) = message_id else {
                continue;
            };
            if self.unindex(&message_id, group, serial)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
