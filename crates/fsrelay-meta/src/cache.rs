//! Cache item store

use bytes::Bytes;
use dashmap::DashMap;
use fsrelay_common::{Error, ItemIndex, MetaKind, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// An immutable cached blob
#[derive(Debug)]
struct CacheItem {
    index: ItemIndex,
    data: Bytes,
    /// `None` never expires
    expires_at: Option<Instant>,
}

impl CacheItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// A live borrow of a cached item.
///
/// Holding one keeps the bytes alive even after the item is invalidated,
/// expired or evicted. Dropping it releases the borrow.
#[derive(Clone)]
pub struct BorrowedItem(Arc<CacheItem>);

impl BorrowedItem {
    #[must_use]
    pub fn index(&self) -> ItemIndex {
        self.0.index
    }

    /// The cached bytes as a cheap shared handle
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        self.0.data.clone()
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.0.expires_at
    }
}

impl Deref for BorrowedItem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0.data
    }
}

impl fmt::Debug for BorrowedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedItem")
            .field("index", &self.0.index)
            .field("len", &self.0.data.len())
            .finish()
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct MetaCacheStats {
    /// Acquires that returned an item
    pub hits: AtomicU64,
    /// Acquires that found nothing usable
    pub misses: AtomicU64,
    /// Items inserted
    pub inserts: AtomicU64,
    /// Items evicted to make room
    pub evictions: AtomicU64,
    /// Items detached by invalidate
    pub invalidations: AtomicU64,
    /// Items detached by the expiration sweep
    pub expirations: AtomicU64,
    /// Inserts that left the store over capacity because every item was borrowed
    pub overcommits: AtomicU64,
}

impl MetaCacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.overcommits.store(0, Ordering::Relaxed);
    }
}

struct Order {
    /// Indices in insertion order (oldest first)
    indices: VecDeque<ItemIndex>,
    /// Last index handed out
    last: ItemIndex,
}

/// Capacity-bounded store of reference-counted blobs
pub struct MetaCache {
    kind: MetaKind,
    /// Attached items, looked up without the order lock
    items: DashMap<ItemIndex, Arc<CacheItem>>,
    /// Insertion order; also serializes insert, evict and sweep
    order: Mutex<Order>,
    capacity: usize,
    item_size_max: usize,
    /// `None` never expires
    ttl: Option<Duration>,
    stats: MetaCacheStats,
}

impl MetaCache {
    /// Create a store. A `ttl` of `None` means items never expire.
    #[must_use]
    pub fn new(kind: MetaKind, capacity: usize, item_size_max: usize, ttl: Option<Duration>) -> Self {
        Self {
            kind,
            items: DashMap::with_capacity(capacity),
            order: Mutex::new(Order {
                indices: VecDeque::with_capacity(capacity),
                last: ItemIndex::NONE,
            }),
            capacity,
            item_size_max,
            ttl,
            stats: MetaCacheStats::default(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MetaKind {
        self.kind
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn item_size_max(&self) -> usize {
        self.item_size_max
    }

    #[must_use]
    pub const fn stats(&self) -> &MetaCacheStats {
        &self.stats
    }

    /// Attached items (including expired ones not yet swept)
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Borrow an item if it is attached and unexpired
    #[must_use]
    pub fn acquire(&self, index: ItemIndex) -> Option<BorrowedItem> {
        self.acquire_at(index, Instant::now())
    }

    /// [`MetaCache::acquire`] against an explicit clock
    #[must_use]
    pub fn acquire_at(&self, index: ItemIndex, now: Instant) -> Option<BorrowedItem> {
        let item = self
            .items
            .get(&index)
            .filter(|item| !item.is_expired(now))
            .map(|item| Arc::clone(item.value()));
        let counter = if item.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        item.map(BorrowedItem)
    }

    /// Store a blob and return its new index
    pub fn insert(&self, data: impl Into<Bytes>) -> Result<ItemIndex> {
        self.insert_at(data, Instant::now())
    }

    /// [`MetaCache::insert`] against an explicit clock
    pub fn insert_at(&self, data: impl Into<Bytes>, now: Instant) -> Result<ItemIndex> {
        let data = data.into();
        if data.len() > self.item_size_max {
            return Err(Error::ItemTooLarge {
                size: data.len(),
                max: self.item_size_max,
            });
        }

        let mut order = self.order.lock();
        while self.items.len() >= self.capacity && self.evict_one(&mut order) {}
        let index = order.last.next();
        order.last = index;
        let item = CacheItem {
            index,
            data,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };
        self.items.insert(index, Arc::new(item));
        order.indices.push_back(index);
        drop(order);

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        trace!("{} cache: inserted item {index}", self.kind);
        Ok(index)
    }

    /// Detach the oldest unborrowed item; counts an overcommit if all are borrowed
    fn evict_one(&self, order: &mut Order) -> bool {
        let victim = order.indices.iter().position(|index| {
            self.items
                .get(index)
                .is_some_and(|item| Arc::strong_count(item.value()) == 1)
        });
        match victim.and_then(|pos| order.indices.remove(pos)) {
            Some(index) => {
                self.items.remove(&index);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("{} cache: evicted item {index}", self.kind);
                true
            }
            None => {
                self.stats.overcommits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "{} cache: all {} items borrowed, inserting over capacity",
                    self.kind,
                    order.indices.len()
                );
                false
            }
        }
    }

    /// Detach an item from future lookups; existing borrows are unaffected
    pub fn invalidate(&self, index: ItemIndex) -> bool {
        if index.is_none() {
            return false;
        }
        let mut order = self.order.lock();
        if self.items.remove(&index).is_none() {
            return false;
        }
        order.indices.retain(|i| *i != index);
        drop(order);
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Detach every item whose expiration time is at or before `now`
    pub fn sweep_expired(&self, now: Instant) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut order = self.order.lock();
        let mut swept = 0;
        // one ttl per store, so insertion order is expiration order
        while let Some(&index) = order.indices.front() {
            let expired = self
                .items
                .get(&index)
                .is_none_or(|item| item.is_expired(now));
            if !expired {
                break;
            }
            order.indices.pop_front();
            if self.items.remove(&index).is_some() {
                swept += 1;
            }
        }
        drop(order);

        if swept > 0 {
            self.stats.expirations.fetch_add(swept as u64, Ordering::Relaxed);
            debug!("{} cache: swept {swept} expired items", self.kind);
        }
        swept
    }

    /// Detach everything
    pub fn clear(&self) {
        let mut order = self.order.lock();
        order.indices.clear();
        self.items.clear();
    }
}

impl fmt::Debug for MetaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaCache")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("item_size_max", &self.item_size_max)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cache(capacity: usize) -> MetaCache {
        MetaCache::new(
            MetaKind::Security,
            capacity,
            1024,
            Some(Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_insert_and_acquire() {
        let cache = cache(4);
        let index = cache.insert(Bytes::from_static(b"descriptor")).unwrap();
        assert!(!index.is_none());

        let item = cache.acquire(index).unwrap();
        assert_eq!(&item[..], b"descriptor");
        assert_eq!(item.index(), index);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_indices_increase() {
        let cache = cache(4);
        let a = cache.insert(vec![1u8]).unwrap();
        let b = cache.insert(vec![2u8]).unwrap();
        assert!(b > a);
        cache.invalidate(b);
        let c = cache.insert(vec![3u8]).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_item_too_large() {
        let cache = cache(4);
        assert_eq!(
            cache.insert(vec![0u8; 1025]),
            Err(Error::ItemTooLarge {
                size: 1025,
                max: 1024
            })
        );
        assert!(cache.insert(vec![0u8; 1024]).is_ok());
    }

    #[test]
    fn test_invalidate() {
        let cache = cache(4);
        let index = cache.insert(vec![7u8; 8]).unwrap();
        let borrowed = cache.acquire(index).unwrap();

        assert!(cache.invalidate(index));
        assert!(!cache.invalidate(index));
        assert!(cache.acquire(index).is_none());
        // outstanding borrow survives
        assert_eq!(&borrowed[..], &[7u8; 8]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_exactly_the_oldest() {
        let cache = cache(3);
        let indices: Vec<_> = (0..3u8).map(|i| cache.insert(vec![i]).unwrap()).collect();
        let newest = cache.insert(vec![9u8]).unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.acquire(indices[0]).is_none());
        assert!(cache.acquire(indices[1]).is_some());
        assert!(cache.acquire(indices[2]).is_some());
        assert!(cache.acquire(newest).is_some());
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_eviction_skips_borrowed() {
        let cache = cache(2);
        let a = cache.insert(vec![1u8]).unwrap();
        let b = cache.insert(vec![2u8]).unwrap();
        let pinned = cache.acquire(a).unwrap();

        cache.insert(vec![3u8]).unwrap();
        assert!(cache.acquire(a).is_some());
        assert!(cache.acquire(b).is_none());
        drop(pinned);
    }

    #[test]
    fn test_all_borrowed_goes_over_capacity() {
        let cache = cache(2);
        let a = cache.insert(vec![1u8]).unwrap();
        let b = cache.insert(vec![2u8]).unwrap();
        let _pa = cache.acquire(a).unwrap();
        let _pb = cache.acquire(b).unwrap();

        let c = cache.insert(vec![3u8]).unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.acquire(c).is_some());
        assert_eq!(cache.stats().overcommits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_overcommit_shrinks_back_after_release() {
        let cache = MetaCache::new(MetaKind::Security, 2, 1024, None);
        let a = cache.insert(vec![1u8]).unwrap();
        let b = cache.insert(vec![2u8]).unwrap();
        let pa = cache.acquire(a).unwrap();
        let pb = cache.acquire(b).unwrap();

        cache.insert(vec![3u8]).unwrap();
        cache.insert(vec![4u8]).unwrap();
        assert_eq!(cache.len(), 3);

        drop(pa);
        drop(pb);
        let newest = cache.insert(vec![5u8]).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.acquire(newest).is_some());

        for i in 0..10u8 {
            cache.insert(vec![i]).unwrap();
            assert!(cache.len() <= 2);
        }
    }

    #[test]
    fn test_expiration() {
        let cache = cache(4);
        let now = Instant::now();
        let old = cache.insert_at(vec![1u8], now).unwrap();
        let young = cache.insert_at(vec![2u8], now + Duration::from_millis(50)).unwrap();
        let borrowed = cache.acquire_at(old, now).unwrap();

        let later = now + Duration::from_millis(120);
        assert!(cache.acquire_at(old, later).is_none());
        assert_eq!(cache.sweep_expired(later), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.acquire_at(young, later).is_some());
        assert_eq!(&borrowed[..], &[1]);

        assert_eq!(cache.sweep_expired(now + Duration::from_millis(200)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_never_expires() {
        let cache = MetaCache::new(MetaKind::Ea, 4, 64, None);
        let index = cache.insert(vec![1u8]).unwrap();
        let far = Instant::now() + Duration::from_secs(86_400);
        assert_eq!(cache.sweep_expired(far), 0);
        assert!(cache.acquire_at(index, far).is_some());
        assert!(cache.acquire(index).unwrap().expires_at().is_none());
    }

    #[test]
    fn test_hit_ratio() {
        let cache = cache(4);
        let index = cache.insert(vec![1u8]).unwrap();
        let _ = cache.acquire(index);
        let _ = cache.acquire(ItemIndex::new(999));
        assert!((cache.stats().hit_ratio() - 0.5).abs() < f64::EPSILON);
        cache.stats().reset();
        assert!(cache.stats().hit_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_borrowers() {
        let cache = Arc::new(cache(8));
        let index = cache.insert(vec![5u8; 64]).unwrap();
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(item) = cache.acquire(index) {
                            assert_eq!(item.len(), 64);
                        }
                    }
                })
            })
            .collect();
        for i in 0..100u8 {
            cache.insert(vec![i]).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(cache.len() <= 8 + 8);
    }

    #[test]
    fn test_random_churn_keeps_order_and_index_in_step() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let cache = cache(16);
        let mut live: Vec<ItemIndex> = Vec::new();
        let mut held: Vec<BorrowedItem> = Vec::new();
        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 | 1 => live.push(cache.insert(vec![rng.r#gen::<u8>(); rng.gen_range(1..64)]).unwrap()),
                2 if !live.is_empty() => {
                    let index = live.swap_remove(rng.gen_range(0..live.len()));
                    cache.invalidate(index);
                }
                _ => {
                    if let Some(index) = live.last()
                        && let Some(item) = cache.acquire(*index)
                    {
                        held.push(item);
                    }
                    if held.len() > 8 {
                        held.clear();
                    }
                }
            }
            assert_eq!(cache.len(), cache.order.lock().indices.len());
            assert!(cache.len() <= 16 + held.len());
        }
    }
}
