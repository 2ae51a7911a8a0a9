//! Owner association: at most one current cache item per owner and kind

use crate::cache::{BorrowedItem, MetaCache};
use bytes::Bytes;
use fsrelay_common::{ItemIndex, MetaKind, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// The index of an owner's current item for one kind of metadata
#[derive(Debug, Default)]
pub struct OwnerSlot(AtomicU64);

impl OwnerSlot {
    #[must_use]
    pub fn current(&self) -> ItemIndex {
        ItemIndex::new(self.0.load(Ordering::Acquire))
    }

    /// Borrow the owner's current item if it is still attached and fresh
    #[must_use]
    pub fn acquire(&self, cache: &MetaCache) -> Option<BorrowedItem> {
        let index = self.current();
        if index.is_none() {
            return None;
        }
        cache.acquire(index)
    }

    /// Make `index` the owner's item, detaching the previous one
    pub fn install(&self, cache: &MetaCache, index: ItemIndex) {
        let previous = ItemIndex::new(self.0.swap(index.as_u64(), Ordering::AcqRel));
        if previous != index {
            cache.invalidate(previous);
        }
    }

    /// Insert `data` as the owner's new item and borrow it
    pub fn populate(&self, cache: &MetaCache, data: impl Into<Bytes>) -> Result<Option<BorrowedItem>> {
        let index = cache.insert(data)?;
        self.install(cache, index);
        Ok(cache.acquire(index))
    }

    /// Forget the owner's item and detach it from the cache
    pub fn invalidate(&self, cache: &MetaCache) -> bool {
        let previous = ItemIndex::new(self.0.swap(0, Ordering::AcqRel));
        cache.invalidate(previous)
    }

    /// Forget the owner's item without touching the cache
    pub fn clear(&self) -> ItemIndex {
        ItemIndex::new(self.0.swap(0, Ordering::AcqRel))
    }
}

/// One [`OwnerSlot`] per [`MetaKind`]
#[derive(Debug, Default)]
pub struct OwnerSlots {
    security: OwnerSlot,
    dir_info: OwnerSlot,
    stream_info: OwnerSlot,
    ea: OwnerSlot,
}

impl OwnerSlots {
    #[must_use]
    pub const fn get(&self, kind: MetaKind) -> &OwnerSlot {
        match kind {
            MetaKind::Security => &self.security,
            MetaKind::DirInfo => &self.dir_info,
            MetaKind::StreamInfo => &self.stream_info,
            MetaKind::Ea => &self.ea,
        }
    }
}
