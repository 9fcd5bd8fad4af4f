//! Block caching for strata trees.
//!
//! This crate provides the pinned node cache used by the B-tree:
//! - A fixed number of slots addressed by BID
//! - Fix counting that keeps in-use blocks resident
//! - Dirty tracking with write-back on eviction, flush and drop
//! - LRU or clock replacement

mod node_cache;
mod replacer;
mod slot;

pub use node_cache::{CachedBlock, NodeCache, NodeCacheStats};
pub use replacer::{make_replacer, ClockReplacer, LruReplacer, Replacer};
pub use slot::SlotId;
