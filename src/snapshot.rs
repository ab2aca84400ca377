//! Snapshot registry: multi-reader sequence pinning.
//!
//! A snapshot pins a sequence number so reads see exactly the state at
//! acquisition: entries with a higher sequence are filtered out, and the
//! compaction collaborator must not drop any version still visible at the
//! oldest pinned sequence. The registry keeps one refcounted entry per
//! distinct live sequence; acquisitions at the current database sequence
//! (which only grows) merge into the newest entry, so the common path does
//! no searching.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Registry of live pinned sequences. Shared between the database, its
/// snapshots and the compaction collaborator.
pub struct SnapshotList {
    /// Live sequences to refcounts, ordered; mutated only under the lock.
    entries: Mutex<BTreeMap<u64, usize>>,
    /// Set when the owning database closes; outstanding snapshots then
    /// answer with the database-closed error instead of stale reads.
    closed: AtomicBool,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Pins `seq`. Sequences arrive in non-decreasing order; pinning a
    /// sequence that is already live is a refcount bump on its entry.
    pub fn acquire(self: &Arc<Self>, seq: u64) -> Snapshot {
        let mut entries = lock(&self.entries);
        *entries.entry(seq).or_insert(0) += 1;
        drop(entries);
        Snapshot::new(self.clone(), seq)
    }

    /// The oldest live pinned sequence, or `fallback` when nothing is
    /// pinned. Compaction must keep every version visible at this
    /// sequence.
    pub fn oldest_seq(&self, fallback: u64) -> u64 {
        let entries = lock(&self.entries);
        entries.keys().next().copied().unwrap_or(fallback)
    }

    /// Number of distinct pinned sequences.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Marks the owning database closed. Outstanding snapshots keep their
    /// pins but refuse further reads.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn release_seq(&self, seq: u64) {
        let mut entries = lock(&self.entries);
        if let Some(refs) = entries.get_mut(&seq) {
            *refs -= 1;
            if *refs == 0 {
                entries.remove(&seq);
            }
        }
    }
}

impl Default for SnapshotList {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(entries: &Mutex<BTreeMap<u64, usize>>) -> std::sync::MutexGuard<'_, BTreeMap<u64, usize>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A pinned point-in-time view. Dropping the snapshot releases the pin;
/// explicit release is idempotent.
pub struct Snapshot {
    snaps: Arc<SnapshotList>,
    seq: u64,
    released: AtomicU32,
}

impl Snapshot {
    fn new(snaps: Arc<SnapshotList>, seq: u64) -> Self {
        Self {
            snaps,
            seq,
            released: AtomicU32::new(0),
        }
    }

    /// The pinned sequence.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether an entry written at `seq` is visible to this snapshot.
    pub fn visible(&self, seq: u64) -> bool {
        seq <= self.seq
    }

    /// Guards every read through this snapshot: released snapshots and
    /// snapshots of a closed database refuse the operation.
    pub fn check(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) != 0 {
            return Err(Error::SnapshotReleased);
        }
        if self.snaps.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Releases the pin. The first call unlinks the registry entry; later
    /// calls return without effect.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.snaps.release_seq(self.seq);
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.release();
    }
}
