//! # Newsgroup Interning
//!
//! Hash chain nodes are small, so instead of a group name each node stores
//! a 16-bit [`GroupId`]. The mapping lives in `.newsgroup`, an append-only
//! text file shared by every process:
//!
//! ```text
//! 1 comp.lang.rust
//! 2 alt.test
//! 3 news.software.nntp
//! ```
//!
//! Ids are assigned as highest-known + 1, starting at 1, and are never
//! reused, so the file is a log that only ever grows. Each process keeps an
//! in-memory copy plus a high-water mark: a reload parses only the bytes
//! appended since the last one. A final line without its `\n` belongs to an
//! append still in progress and is left for a later reload.
//!
//! New names are appended under the file's advisory lock after a reload, so
//! two processes interning the same new name agree on one id.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{debug, error, warn};

use crate::config::{AccessOptions, FIRST_GROUP_ID, MAX_GROUP_ID, MAX_GROUP_NAME_LEN};
use crate::error::StoreError;
use crate::storage::FileLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u16);

impl GroupId {
    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

/// Group names become directory names and appear inside alias records, so
/// anything that would break either is refused.
pub fn validate_group_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.len() > MAX_GROUP_NAME_LEN
        || name.starts_with('.')
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | ':' | '<' | '\0'));
    if bad {
        bail!(StoreError::InvalidGroupName {
            name: name.to_string()
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct GroupTable {
    path: PathBuf,
    file: File,
    access: AccessOptions,
    by_name: HashMap<String, GroupId>,
    by_id: HashMap<GroupId, String>,
    highest: u32,
    consumed: u64,
}

impl GroupTable {
    pub fn open(path: &Path, access: AccessOptions) -> Result<Self> {
        let file = if access.read_only {
            OpenOptions::new().read(true).open(path)
        } else {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)
        }
        .wrap_err_with(|| format!("failed to open newsgroup file '{}'", path.display()))?;

        let mut table = Self {
            path: path.to_path_buf(),
            file,
            access,
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            highest: 0,
            consumed: 0,
        };
        table.reload()?;
        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of groups known after the last reload.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Known groups in id order.
    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &str)> {
        let mut groups: Vec<_> = self
            .by_id
            .iter()
            .map(|(id, name)| (*id, name.as_str()))
            .collect();
        groups.sort_unstable_by_key(|(id, _)| *id);
        groups.into_iter()
    }

    pub fn id(&mut self, name: &str) -> Result<Option<GroupId>> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(Some(*id));
        }
        self.reload()?;
        Ok(self.by_name.get(name).copied())
    }

    pub fn name(&mut self, id: GroupId) -> Result<Option<&str>> {
        if !self.by_id.contains_key(&id) {
            self.reload()?;
        }
        Ok(self.by_id.get(&id).map(String::as_str))
    }

    pub fn intern(&mut self, name: &str) -> Result<GroupId> {
        validate_group_name(name)?;
        if let Some(id) = self.id(name)? {
            return Ok(id);
        }
        if self.access.read_only {
            bail!(StoreError::ReadOnly {
                path: self.path.clone()
            });
        }

        let _lock = FileLock::acquire(&self.file, &self.path, &self.access.lock)?;
        self.reload()?;
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }

        let next = self.highest + 1;
        if next > MAX_GROUP_ID {
            bail!(StoreError::GroupTableFull {
                highest: self.highest
            });
        }

        let start = self.end_of_file()?;
        let line = format!("{} {}\n", next, name);
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            self.truncate_to(start);
            return Err(err)
                .wrap_err_with(|| format!("failed to append to '{}'", self.path.display()));
        }

        let id = GroupId(next as u16);
        if let Err(err) = self.record(id, name) {
            self.truncate_to(start);
            return Err(err);
        }
        self.consumed = start + line.len() as u64;

        debug!(group = name, id = next, "interned newsgroup");
        Ok(id)
    }

    /// Parses whatever complete lines were appended since the last reload.
    pub fn reload(&mut self) -> Result<()> {
        let len = self.end_of_file()?;
        if len <= self.consumed {
            return Ok(());
        }

        let mut buf = Vec::with_capacity((len - self.consumed) as usize);
        let mut reader = &self.file;
        reader
            .seek(SeekFrom::Start(self.consumed))
            .and_then(|_| reader.read_to_end(&mut buf))
            .wrap_err_with(|| format!("failed to read '{}'", self.path.display()))?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(());
        };

        for line in buf[..last_newline].split(|&b| b == b'\n') {
            match parse_line(line) {
                Some((id, name)) => {
                    if let Err(err) = self.record(id, name) {
                        warn!(path = %self.path.display(), %err, "skipping newsgroup record");
                    }
                }
                None if line.iter().all(u8::is_ascii_whitespace) => {}
                None => error!(
                    path = %self.path.display(),
                    line = %String::from_utf8_lossy(line),
                    "malformed newsgroup record"
                ),
            }
        }
        self.consumed += last_newline as u64 + 1;
        Ok(())
    }

    fn record(&mut self, id: GroupId, name: &str) -> Result<()> {
        if let Some(existing) = self.by_name.get(name) {
            bail!(StoreError::corrupt(
                &self.path,
                format!("group {} already has id {}", name, existing.0)
            ));
        }
        if let Some(existing) = self.by_id.get(&id) {
            bail!(StoreError::corrupt(
                &self.path,
                format!("id {} already names {}", id.0, existing)
            ));
        }

        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        self.highest = self.highest.max(id.0 as u32);
        Ok(())
    }

    fn end_of_file(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?
            .len())
    }

    fn truncate_to(&self, len: u64) {
        if let Err(err) = self.file.set_len(len) {
            error!(path = %self.path.display(), %err, "failed to roll back newsgroup append");
        }
    }
}

fn parse_line(line: &[u8]) -> Option<(GroupId, &str)> {
    let line = std::str::from_utf8(line).ok()?;
    let (id, name) = line.trim_start().split_once(' ')?;
    let id: u32 = id.parse().ok()?;
    let name = name.trim();
    if !(FIRST_GROUP_ID..=MAX_GROUP_ID).contains(&id) || name.is_empty() {
        return None;
    }
    Some((GroupId(id as u16), name))
}
