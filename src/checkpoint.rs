//! Durable record of completed and failed work items.
//!
//! The snapshot is a versioned JSON document written with an atomic
//! temp-file-and-rename, so a crash mid-write leaves the previous snapshot
//! intact. Completions are flushed every `flush_every` items and on shutdown;
//! an item that finished remotely after the last flush may be processed again
//! on resume, but a flushed item never is.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::keys::KeyStats;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Aggregate counters across all runs that shared this checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// On-disk checkpoint contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Identifiers of items whose caption has been written.
    pub done: BTreeSet<String>,
    /// Items that failed permanently, with the last error; input to the fix pass.
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    #[serde(default)]
    pub counters: Counters,
    /// Key usage from the most recent run.
    #[serde(default)]
    pub key_stats: Vec<KeyStats>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            done: BTreeSet::new(),
            failed: BTreeMap::new(),
            counters: Counters::default(),
            key_stats: Vec::new(),
        }
    }
}

/// Accepted on-disk layouts. A bare list of identifiers predates versioning.
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Versioned(Snapshot),
    Legacy(Vec<String>),
}

impl Snapshot {
    /// Read a snapshot file, upgrading older layouts.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let file: SnapshotFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))?;

        match file {
            SnapshotFile::Versioned(snapshot) if snapshot.version > SNAPSHOT_VERSION => {
                anyhow::bail!(
                    "Checkpoint {} has version {}, newer than supported version {SNAPSHOT_VERSION}",
                    path.display(),
                    snapshot.version
                )
            }
            SnapshotFile::Versioned(mut snapshot) => {
                snapshot.version = SNAPSHOT_VERSION;
                Ok(snapshot)
            }
            SnapshotFile::Legacy(ids) => {
                log::info!("Upgrading unversioned checkpoint with {} entries", ids.len());
                Ok(Self {
                    counters: Counters {
                        processed: ids.len() as u64,
                        ..Counters::default()
                    },
                    done: ids.into_iter().collect(),
                    ..Self::default()
                })
            }
        }
    }

    /// Write the snapshot atomically (temp file in the same directory, then rename).
    pub fn write(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_vec_pretty(self).context("Failed to serialize checkpoint")?;
        write_atomic(path, &contents)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))
    }
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).context("Failed to create temp file")?;
    tmp.write_all(contents).context("Failed to write temp file")?;
    tmp.as_file().sync_all().context("Failed to sync temp file")?;
    tmp.persist(path).context("Failed to move temp file into place")?;
    Ok(())
}

struct StoreState {
    snapshot: Snapshot,
    unflushed: usize,
}

/// Shared, lock-protected checkpoint used by all workers.
pub struct CheckpointStore {
    path: PathBuf,
    flush_every: usize,
    state: Mutex<StoreState>,
    /// Serializes writers so an older snapshot never overwrites a newer one.
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Load the checkpoint at `path`, or start empty if it does not exist.
    pub fn load(path: &Path, flush_every: usize) -> Result<Self> {
        let snapshot = if path.exists() {
            let snapshot = Snapshot::read(path)?;
            log::info!(
                "Loaded checkpoint with {} completed and {} failed item(s)",
                snapshot.done.len(),
                snapshot.failed.len()
            );
            snapshot
        } else {
            Snapshot::default()
        };
        Ok(Self::with_snapshot(path, snapshot, flush_every))
    }

    pub fn with_snapshot(path: &Path, snapshot: Snapshot, flush_every: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            flush_every: flush_every.max(1),
            state: Mutex::new(StoreState {
                snapshot,
                unflushed: 0,
            }),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.state.lock().snapshot.done.contains(id)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.state.lock().snapshot.failed.contains_key(id)
    }

    /// Record a completed item; flushes when the batch threshold is reached.
    pub fn mark_done(&self, id: &str) {
        let should_flush = {
            let mut state = self.state.lock();
            if !state.snapshot.done.insert(id.to_string()) {
                return;
            }
            state.snapshot.failed.remove(id);
            state.snapshot.counters.processed += 1;
            state.unflushed += 1;
            state.unflushed >= self.flush_every
        };
        if should_flush {
            self.flush();
        }
    }

    /// Record a permanent failure for the fix pass; flushes on the same threshold as completions.
    pub fn mark_failed(&self, id: &str, reason: &str) {
        let should_flush = {
            let mut state = self.state.lock();
            state
                .snapshot
                .failed
                .insert(id.to_string(), reason.to_string());
            state.snapshot.counters.failed += 1;
            state.unflushed += 1;
            state.unflushed >= self.flush_every
        };
        if should_flush {
            self.flush();
        }
    }

    pub fn mark_skipped(&self, count: u64) {
        self.state.lock().snapshot.counters.skipped += count;
    }

    pub fn set_key_stats(&self, stats: Vec<KeyStats>) {
        self.state.lock().snapshot.key_stats = stats;
    }

    pub fn done_count(&self) -> usize {
        self.state.lock().snapshot.done.len()
    }

    /// Failed item identifiers in sorted order.
    pub fn failed_ids(&self) -> Vec<String> {
        self.state.lock().snapshot.failed.keys().cloned().collect()
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().snapshot.counters
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.lock().snapshot.clone()
    }

    /// Persist the current state.
    pub fn save(&self) -> Result<()> {
        let _writer = self.write_lock.lock();
        let snapshot = {
            let mut state = self.state.lock();
            state.unflushed = 0;
            state.snapshot.clone()
        };
        snapshot.write(&self.path)
    }

    /// Best-effort [`save`](Self::save): failures are logged and the run goes on.
    pub fn flush(&self) {
        if let Err(e) = self.save() {
            log::warn!("Checkpoint not saved, continuing with in-memory state: {e:#}");
        }
    }
}
