//! fsrelay Meta - metadata caches
//!
//! Slowly-changing metadata (security descriptors, directory listings,
//! stream listings, EA lists) is cached so repeated queries skip the round
//! trip to the remote.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                         MetaCaches                          │
//! │  security │ dir_info │ stream_info │ ea    (one MetaCache   │
//! │                                            per kind)        │
//! ├────────────────────────────────────────────────────────────┤
//! │  MetaCache: index map (concurrent) + insertion order list   │
//! │     ItemIndex ──► Arc<CacheItem> ──► BorrowedItem (clones)  │
//! └────────────────────────────────────────────────────────────┘
//!        ▲
//!        │ at most one current ItemIndex per owner and kind
//!  OwnerSlots (held by each file/directory node)
//! ```
//!
//! Items are immutable after insert. A borrow is an `Arc` clone, so a
//! reader never holds a lock and an invalidated or expired item stays
//! alive until its last borrow is dropped.

pub mod cache;
pub mod set;
pub mod slot;

pub use cache::{BorrowedItem, MetaCache, MetaCacheStats};
pub use set::MetaCaches;
pub use slot::{OwnerSlot, OwnerSlots};
