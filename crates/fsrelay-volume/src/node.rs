//! Open file nodes and their cache associations

use bytes::Bytes;
use fsrelay_common::{MetaKind, OwnerKey, Result};
use fsrelay_meta::{BorrowedItem, MetaCache, OwnerSlots};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One open file or directory, shared by every handle on the same path.
///
/// Each node owns at most one cache item per [`MetaKind`]. A per-kind change
/// number guards population: a listing fetched before an invalidation must
/// not be installed after it.
#[derive(Debug)]
pub struct Node {
    key: OwnerKey,
    path: String,
    slots: OwnerSlots,
    changes: Mutex<[u64; 4]>,
    opens: AtomicUsize,
}

const fn kind_slot(kind: MetaKind) -> usize {
    match kind {
        MetaKind::Security => 0,
        MetaKind::DirInfo => 1,
        MetaKind::StreamInfo => 2,
        MetaKind::Ea => 3,
    }
}

impl Node {
    pub(crate) fn new(key: OwnerKey, path: String) -> Self {
        Self {
            key,
            path,
            slots: OwnerSlots::default(),
            changes: Mutex::new([0; 4]),
            opens: AtomicUsize::new(1),
        }
    }

    #[must_use]
    pub const fn key(&self) -> OwnerKey {
        self.key
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of handles open on this node
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.opens.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one open; returns `true` when it was the last
    pub(crate) fn release(&self) -> bool {
        self.opens.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Current change number for `kind`
    #[must_use]
    pub fn change_number(&self, kind: MetaKind) -> u64 {
        self.changes.lock()[kind_slot(kind)]
    }

    /// Borrow the node's cached item for `kind`
    #[must_use]
    pub fn cached(&self, cache: &MetaCache, kind: MetaKind) -> Option<BorrowedItem> {
        self.slots.get(kind).acquire(cache)
    }

    /// Install `data` as the node's item for `kind` unless the node changed
    /// since `seen` was read. Returns `Ok(None)` if the install was skipped.
    pub fn populate(
        &self,
        cache: &MetaCache,
        kind: MetaKind,
        seen: u64,
        data: Bytes,
    ) -> Result<Option<BorrowedItem>> {
        let changes = self.changes.lock();
        if changes[kind_slot(kind)] != seen {
            return Ok(None);
        }
        let item = self.slots.get(kind).populate(cache, data);
        drop(changes);
        item
    }

    /// Detach the node's item for `kind` and bump its change number
    pub fn invalidate(&self, cache: Option<&MetaCache>, kind: MetaKind) {
        let mut changes = self.changes.lock();
        changes[kind_slot(kind)] += 1;
        let slot = self.slots.get(kind);
        match cache {
            Some(cache) => {
                slot.invalidate(cache);
            }
            None => {
                slot.clear();
            }
        }
    }
}
