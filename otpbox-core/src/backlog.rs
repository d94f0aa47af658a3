// File:    backlog.rs
// Author:  apezoo
// Date:    2026-10-16
//
// Description: Overflow storage for key queue entries that do not fit the in-memory budget.
//
// License:
// This project is licensed under the terms of the GNU AGPLv3 license.
// See the LICENSE.md file in the project root for full license information.

//! Key backlog stores.
//!
//! A [`BacklogStore`] maps ids to serialized key material. [`FileBacklog`]
//! keeps the map in a JSON file next to the session, [`MemoryBacklog`] keeps
//! it in memory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};

/// Keyed storage of spilled key material.
pub trait BacklogStore: Send {
    /// Stores `bytes` under `id`, replacing an earlier entry.
    fn put(&mut self, id: u64, bytes: Vec<u8>) -> Result<()>;

    /// Stores several entries at once.
    fn put_many(&mut self, entries: Vec<(u64, Vec<u8>)>) -> Result<()> {
        for (id, bytes) in entries {
            self.put(id, bytes)?;
        }
        Ok(())
    }

    /// Entries with `lo <= id <= hi`, in id order.
    fn get_range(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Removes and returns the entry under `id`.
    fn remove(&mut self, id: u64) -> Result<Option<Vec<u8>>>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// True when nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory backlog.
#[derive(Debug, Default)]
pub struct MemoryBacklog {
    entries: BTreeMap<u64, Vec<u8>>,
}

impl MemoryBacklog {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BacklogStore for MemoryBacklog {
    fn put(&mut self, id: u64, bytes: Vec<u8>) -> Result<()> {
        self.entries.insert(id, bytes);
        Ok(())
    }

    fn get_range(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        if lo > hi {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .range(lo..=hi)
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect())
    }

    fn remove(&mut self, id: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.remove(&id))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Backlog persisted as a JSON file, rewritten atomically on every change.
///
/// When the stored bytes exceed the configured limit the oldest entries are
/// dropped.
#[derive(Debug)]
pub struct FileBacklog {
    path: PathBuf,
    entries: BTreeMap<u64, Vec<u8>>,
    stored_bytes: usize,
    limit_bytes: usize,
}

impl FileBacklog {
    /// Opens the backlog at `path`, loading earlier entries when the file exists.
    pub fn open(path: &Path, limit_kb: usize) -> Result<Self> {
        let entries: BTreeMap<u64, Vec<u8>> = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text).map_err(|e| {
                Error::Backlog(format!("cannot parse backlog {}: {e}", path.display()))
            })?
        } else {
            BTreeMap::new()
        };
        let stored_bytes = entries.values().map(Vec::len).sum();
        debug!(
            "Opened key backlog {} with {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            stored_bytes,
            limit_bytes: limit_kb * 1024,
        })
    }

    /// Path of the backlog file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn insert(&mut self, id: u64, bytes: Vec<u8>) {
        self.stored_bytes += bytes.len();
        if let Some(old) = self.entries.insert(id, bytes) {
            self.stored_bytes -= old.len();
        }
    }

    fn enforce_limit(&mut self) {
        let mut dropped = 0usize;
        while self.stored_bytes > self.limit_bytes {
            let Some((_, bytes)) = self.entries.pop_first() else {
                break;
            };
            self.stored_bytes -= bytes.len();
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                "Key backlog {} over its limit, dropped {dropped} oldest entries",
                self.path.display()
            );
        }
    }

    fn persist(&self) -> Result<()> {
        let text = serde_json::to_string(&self.entries)
            .map_err(|e| Error::Backlog(format!("cannot serialize backlog: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|e| Error::Backlog(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Backlog(format!("{}: {e}", self.path.display())))
    }
}

impl BacklogStore for FileBacklog {
    fn put(&mut self, id: u64, bytes: Vec<u8>) -> Result<()> {
        self.insert(id, bytes);
        self.enforce_limit();
        self.persist()
    }

    fn put_many(&mut self, entries: Vec<(u64, Vec<u8>)>) -> Result<()> {
        for (id, bytes) in entries {
            self.insert(id, bytes);
        }
        self.enforce_limit();
        self.persist()
    }

    fn get_range(&self, lo: u64, hi: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        if lo > hi {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .range(lo..=hi)
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect())
    }

    fn remove(&mut self, id: u64) -> Result<Option<Vec<u8>>> {
        let removed = self.entries.remove(&id);
        if let Some(bytes) = &removed {
            self.stored_bytes -= bytes.len();
            self.persist()?;
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
