//! Pinned, write-back cache of tree blocks.
//!
//! Entries are addressed by BID. A fixed entry (fix count > 0) is never
//! evicted; an unfixed one stays cached until the replacer picks it, at
//! which point it is written back if dirty. The cache is driven by one
//! thread; only the block reads and writes beneath it are asynchronous.

use crate::replacer::{make_replacer, Replacer};
use crate::slot::{CacheSlot, SlotId, SlotState};
use std::collections::HashMap;
use std::sync::Arc;
use strata_common::{Bid, CacheConfig, Result, StrataError};
use strata_io::{wait_all, AllocationStrategy, BlockManager};
use tracing::{debug, warn};

/// A block type that can live in a [`NodeCache`].
pub trait CachedBlock: Sized {
    /// A freshly allocated, empty block stored at `bid`.
    fn empty(bid: Bid) -> Self;

    /// Serializes the block into `buf`, which spans the whole block.
    fn encode(&self, buf: &mut [u8]) -> Result<()>;

    /// Rebuilds the block stored at `bid` from its bytes.
    fn decode(bid: Bid, buf: &[u8]) -> Result<Self>;
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCacheStats {
    /// Maximum number of cached blocks.
    pub capacity: usize,
    /// Blocks cached or being loaded.
    pub resident: usize,
    /// Entries with a non-zero fix count.
    pub fixed: usize,
    /// Entries modified since their last write.
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Dirty blocks written to disk, by eviction or flush.
    pub writebacks: u64,
    pub prefetches: u64,
}

fn encode_block<N: CachedBlock>(node: &N, block_size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; block_size];
    node.encode(&mut buf)?;
    Ok(buf)
}

/// Cache of blocks of type `N`, all `block_size` bytes long.
pub struct NodeCache<N: CachedBlock> {
    manager: Arc<BlockManager>,
    block_size: usize,
    strategy: Box<dyn AllocationStrategy>,
    /// Running allocation index handed to the strategy.
    next_index: usize,
    slots: Vec<CacheSlot<N>>,
    table: HashMap<Bid, SlotId>,
    free_list: Vec<SlotId>,
    replacer: Box<dyn Replacer>,
    hits: u64,
    misses: u64,
    evictions: u64,
    writebacks: u64,
    prefetches: u64,
}

impl<N: CachedBlock> NodeCache<N> {
    /// Creates a cache of `config.capacity_blocks` entries. New blocks are
    /// placed by `strategy`.
    pub fn new(
        manager: Arc<BlockManager>,
        block_size: usize,
        config: &CacheConfig,
        strategy: Box<dyn AllocationStrategy>,
    ) -> Result<Self> {
        let capacity = config.capacity_blocks;
        if capacity == 0 {
            return Err(StrataError::invalid_parameter("cache capacity", 0));
        }
        if block_size == 0 {
            return Err(StrataError::invalid_parameter("block size", 0));
        }

        let slots = (0..capacity).map(|_| CacheSlot::empty()).collect();
        // Popped from the back, so slot 0 is used first.
        let free_list = (0..capacity as u32).rev().map(SlotId).collect();

        debug!(
            capacity,
            block_size,
            policy = ?config.policy,
            strategy = strategy.name(),
            "node cache created"
        );
        Ok(Self {
            manager,
            block_size,
            strategy,
            next_index: 0,
            slots,
            table: HashMap::with_capacity(capacity),
            free_list,
            replacer: make_replacer(config.policy, capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
            writebacks: 0,
            prefetches: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    /// Number of cached (or loading) blocks.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn is_resident(&self, bid: Bid) -> bool {
        self.table.contains_key(&bid)
    }

    /// Fix count of `bid`, or None when it is not cached.
    pub fn fix_count(&self, bid: Bid) -> Option<u32> {
        self.table
            .get(&bid)
            .map(|id| self.slots[id.index()].fix_count())
    }

    pub fn is_dirty(&self, bid: Bid) -> bool {
        self.table
            .get(&bid)
            .is_some_and(|id| self.slots[id.index()].is_dirty())
    }

    /// Finds a slot for a new entry, evicting if no slot is free.
    fn allocate_slot(&mut self) -> Result<SlotId> {
        if let Some(id) = self.free_list.pop() {
            return Ok(id);
        }
        let victim = self.replacer.evict().ok_or(StrataError::CacheFull)?;
        if let Err(e) = self.evict_slot(victim) {
            self.replacer.set_evictable(victim, true);
            return Err(e);
        }
        Ok(victim)
    }

    fn evict_slot(&mut self, id: SlotId) -> Result<()> {
        let slot = &mut self.slots[id.index()];
        let bid = slot.bid();
        assert!(
            !slot.is_fixed(),
            "evicting {bid} with fix count {}",
            slot.fix_count()
        );

        if let Some(request) = slot.take_request() {
            // Prefetched but never used.
            if let Err(e) = request.wait() {
                debug!(bid = %bid, error = %e, "discarded prefetch failed");
            }
        } else if slot.is_dirty() {
            if let Some(node) = slot.node() {
                let data = encode_block(node, self.block_size)?;
                self.manager.write_block(bid, data)?;
                self.writebacks += 1;
            }
        }

        slot.reset();
        self.table.remove(&bid);
        self.evictions += 1;
        debug!(bid = %bid, slot = id.0, "evicted");
        Ok(())
    }

    /// Drops slot `id` without writing it back.
    fn release_slot(&mut self, id: SlotId) {
        let slot = &mut self.slots[id.index()];
        let bid = slot.bid();
        if let Some(request) = slot.take_request() {
            if let Err(e) = request.wait() {
                debug!(bid = %bid, error = %e, "discarded read failed");
            }
        }
        slot.reset();
        self.table.remove(&bid);
        self.replacer.remove(id);
        self.free_list.push(id);
    }

    /// Completes a prefetch of slot `id`, if one is pending.
    fn finish_loading(&mut self, id: SlotId) -> Result<()> {
        let slot = &mut self.slots[id.index()];
        let bid = slot.bid();
        let Some(request) = slot.take_request() else {
            return Ok(());
        };
        let node = request
            .wait_buffer()
            .and_then(|data| N::decode(bid, &data));
        match node {
            Ok(node) => {
                self.slots[id.index()].install(bid, node, false);
                Ok(())
            }
            Err(e) => {
                self.release_slot(id);
                Err(e)
            }
        }
    }

    fn pin(&mut self, id: SlotId, fix: bool) {
        let slot = &mut self.slots[id.index()];
        if fix {
            slot.fix();
            self.replacer.set_evictable(id, false);
        } else if !slot.is_fixed() {
            self.replacer.set_evictable(id, true);
        }
        self.replacer.record_access(id);
    }

    /// Allocates a block, caches an empty node for it and returns its BID.
    /// The entry is fixed once and dirty.
    pub fn get_new_node(&mut self) -> Result<Bid> {
        let id = self.allocate_slot()?;
        let bid = match self
            .manager
            .new_block(self.strategy.as_mut(), self.block_size, self.next_index)
        {
            Ok(bid) => bid,
            Err(e) => {
                self.free_list.push(id);
                return Err(e);
            }
        };
        self.next_index += 1;

        self.slots[id.index()].install(bid, N::empty(bid), true);
        self.table.insert(bid, id);
        self.pin(id, true);
        debug!(bid = %bid, slot = id.0, "new node");
        Ok(bid)
    }

    /// Returns the node stored at `bid`, loading it on a miss. With `fix`
    /// the entry is fixed once more and must later be unfixed.
    pub fn get_node(&mut self, bid: Bid, fix: bool) -> Result<&N> {
        let id = match self.table.get(&bid).copied() {
            Some(id) => {
                self.hits += 1;
                self.finish_loading(id)?;
                id
            }
            None => {
                self.misses += 1;
                let id = self.allocate_slot()?;
                let node = self
                    .manager
                    .read_block(bid, self.block_size)
                    .and_then(|data| N::decode(bid, &data));
                match node {
                    Ok(node) => {
                        self.slots[id.index()].install(bid, node, false);
                        self.table.insert(bid, id);
                        debug!(bid = %bid, slot = id.0, "loaded");
                        id
                    }
                    Err(e) => {
                        self.free_list.push(id);
                        return Err(e);
                    }
                }
            }
        };
        self.pin(id, fix);
        self.slots[id.index()]
            .node()
            .ok_or_else(|| StrataError::Internal(format!("{bid} not resident after load")))
    }

    /// Drops one fix of `bid`. At zero the entry becomes evictable; it is
    /// written back only when evicted or flushed.
    ///
    /// # Panics
    ///
    /// Panics if `bid` is not cached or not fixed.
    pub fn unfix_node(&mut self, bid: Bid) {
        let id = match self.table.get(&bid) {
            Some(&id) => id,
            None => panic!("unfix of {bid} which is not cached"),
        };
        if self.slots[id.index()].unfix() == 0 {
            self.replacer.set_evictable(id, true);
        }
    }

    /// Removes `bid` from the cache without writing it and frees its block.
    ///
    /// # Panics
    ///
    /// Panics if the entry is fixed.
    pub fn delete_node(&mut self, bid: Bid) -> Result<()> {
        if let Some(&id) = self.table.get(&bid) {
            let fix = self.slots[id.index()].fix_count();
            assert!(fix == 0, "delete of {bid} with fix count {fix}");
            self.release_slot(id);
        }
        self.manager.delete_block(bid, self.block_size)?;
        debug!(bid = %bid, "node deleted");
        Ok(())
    }

    /// Starts reading `bid` without fixing it. A later `get_node` waits for
    /// the read. Does nothing if the block is cached or no slot can be
    /// freed.
    pub fn prefetch_node(&mut self, bid: Bid) -> Result<()> {
        if self.table.contains_key(&bid) {
            return Ok(());
        }
        let id = match self.allocate_slot() {
            Ok(id) => id,
            Err(StrataError::CacheFull) => {
                debug!(bid = %bid, "prefetch skipped, cache full");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let request = match self
            .manager
            .aread_block(bid, vec![0u8; self.block_size], None)
        {
            Ok(request) => request,
            Err(e) => {
                self.free_list.push(id);
                return Err(e);
            }
        };
        self.slots[id.index()].start_loading(bid, request);
        self.table.insert(bid, id);
        self.pin(id, false);
        self.prefetches += 1;
        Ok(())
    }

    fn resident_index(&self, bid: Bid) -> usize {
        match self.table.get(&bid) {
            Some(id) if !self.slots[id.index()].is_loading() => id.index(),
            _ => panic!("{bid} is not resident in the node cache"),
        }
    }

    /// The cached node at `bid`.
    ///
    /// # Panics
    ///
    /// Panics if `bid` was not loaded through `get_node`/`get_new_node`.
    pub fn node(&self, bid: Bid) -> &N {
        match self.slots[self.resident_index(bid)].state() {
            SlotState::Resident(node) => node,
            _ => panic!("{bid} is not resident in the node cache"),
        }
    }

    /// The cached node at `bid`, marked dirty.
    pub fn node_mut(&mut self, bid: Bid) -> &mut N {
        let idx = self.resident_index(bid);
        let slot = &mut self.slots[idx];
        slot.set_dirty(true);
        match slot.node_mut() {
            Some(node) => node,
            None => panic!("{bid} is not resident in the node cache"),
        }
    }

    /// Two distinct cached nodes, both marked dirty.
    pub fn pair_mut(&mut self, a: Bid, b: Bid) -> (&mut N, &mut N) {
        assert_ne!(a, b, "pair_mut needs two distinct blocks");
        let (ia, ib) = (self.resident_index(a), self.resident_index(b));
        let (first, second) = if ia < ib {
            let (left, right) = self.slots.split_at_mut(ib);
            (&mut left[ia], &mut right[0])
        } else {
            let (left, right) = self.slots.split_at_mut(ia);
            (&mut right[0], &mut left[ib])
        };
        first.set_dirty(true);
        second.set_dirty(true);
        match (first.node_mut(), second.node_mut()) {
            (Some(x), Some(y)) => (x, y),
            _ => panic!("{a} or {b} is not resident in the node cache"),
        }
    }

    /// Writes every dirty entry back, concurrently. Returns how many were
    /// written.
    pub fn flush(&mut self) -> Result<usize> {
        let mut issued = Vec::new();
        let mut requests = Vec::new();
        let mut issue_error = None;

        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.is_dirty() {
                continue;
            }
            let Some(node) = slot.node() else {
                continue;
            };
            let request = encode_block(node, self.block_size)
                .and_then(|data| self.manager.awrite_block(slot.bid(), data, None));
            match request {
                Ok(request) => {
                    issued.push(index);
                    requests.push(request);
                }
                Err(e) => {
                    issue_error = Some(e);
                    break;
                }
            }
        }

        let waited = wait_all(&requests);
        let mut written = 0;
        for (&index, request) in issued.iter().zip(&requests) {
            if request.error().is_none() {
                self.slots[index].set_dirty(false);
                written += 1;
            }
        }
        self.writebacks += written as u64;
        debug!(written, "node cache flushed");

        waited?;
        match issue_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    pub fn stats(&self) -> NodeCacheStats {
        let mut fixed = 0;
        let mut dirty = 0;
        for slot in self.slots.iter().filter(|s| !s.is_free()) {
            if slot.is_fixed() {
                fixed += 1;
            }
            if slot.is_dirty() {
                dirty += 1;
            }
        }
        NodeCacheStats {
            capacity: self.slots.len(),
            resident: self.table.len(),
            fixed,
            dirty,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            writebacks: self.writebacks,
            prefetches: self.prefetches,
        }
    }
}

impl<N: CachedBlock> Drop for NodeCache<N> {
    fn drop(&mut self) {
        let fixed = self.slots.iter().filter(|s| s.is_fixed()).count();
        if fixed > 0 {
            warn!(fixed, "node cache dropped with fixed entries");
        }
        for slot in &mut self.slots {
            if let Some(request) = slot.take_request() {
                if let Err(e) = request.wait() {
                    debug!(error = %e, "prefetch failed before the cache was dropped");
                }
            }
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "node cache write-back failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{ReplacementPolicy, StrategyKind};
    use strata_io::make_strategy_seeded;

    const BLOCK: usize = 256;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        bid: Bid,
        value: u64,
    }

    impl CachedBlock for Counter {
        fn empty(bid: Bid) -> Self {
            Self { bid, value: 0 }
        }

        fn encode(&self, buf: &mut [u8]) -> Result<()> {
            buf[..8].copy_from_slice(&self.value.to_le_bytes());
            Ok(())
        }

        fn decode(bid: Bid, buf: &[u8]) -> Result<Self> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[..8]);
            Ok(Self {
                bid,
                value: u64::from_le_bytes(raw),
            })
        }
    }

    fn cache_with(
        manager: &Arc<BlockManager>,
        capacity: usize,
        policy: ReplacementPolicy,
    ) -> NodeCache<Counter> {
        let config = CacheConfig {
            capacity_blocks: capacity,
            policy,
        };
        let strategy =
            make_strategy_seeded(StrategyKind::Striping, manager.num_disks(), 0).unwrap();
        NodeCache::new(Arc::clone(manager), BLOCK, &config, strategy).unwrap()
    }

    fn new_counter(cache: &mut NodeCache<Counter>, value: u64) -> Bid {
        let bid = cache.get_new_node().unwrap();
        cache.node_mut(bid).value = value;
        cache.unfix_node(bid);
        bid
    }

    #[test]
    fn test_new_node_is_fixed_and_dirty() {
        let bm = Arc::new(BlockManager::in_memory(2).unwrap());
        let mut cache = cache_with(&bm, 4, ReplacementPolicy::Lru);

        let bid = cache.get_new_node().unwrap();
        assert_eq!(cache.fix_count(bid), Some(1));
        assert!(cache.is_dirty(bid));
        assert_eq!(cache.node(bid).bid, bid);
        cache.unfix_node(bid);
        assert_eq!(cache.fix_count(bid), Some(0));
    }

    #[test]
    fn test_node_mut_marks_clean_node_dirty() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 4, ReplacementPolicy::Clock);
        let bid = new_counter(&mut cache, 5);
        cache.flush().unwrap();
        assert!(!cache.is_dirty(bid));

        cache.node_mut(bid).value += 1;
        assert!(cache.is_dirty(bid));
        assert_eq!(cache.node(bid).value, 6);
    }

    #[test]
    fn test_eviction_writes_back_dirty() {
        for policy in [ReplacementPolicy::Lru, ReplacementPolicy::Clock] {
            let bm = Arc::new(BlockManager::in_memory(2).unwrap());
            let mut cache = cache_with(&bm, 2, policy);

            let bids: Vec<Bid> = (0..5).map(|v| new_counter(&mut cache, v * 10)).collect();
            assert_eq!(cache.len(), 2);
            assert!(cache.stats().evictions >= 3);

            for (v, &bid) in bids.iter().enumerate() {
                assert_eq!(cache.get_node(bid, false).unwrap().value, v as u64 * 10);
            }
        }
    }

    #[test]
    fn test_lru_keeps_recently_used() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 3, ReplacementPolicy::Lru);
        let a = new_counter(&mut cache, 1);
        let b = new_counter(&mut cache, 2);
        let c = new_counter(&mut cache, 3);

        cache.get_node(a, false).unwrap();
        new_counter(&mut cache, 4);

        assert!(cache.is_resident(a));
        assert!(!cache.is_resident(b));
        assert!(cache.is_resident(c));
    }

    #[test]
    fn test_fixed_entries_are_not_evicted() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
        let a = cache.get_new_node().unwrap();
        let b = cache.get_new_node().unwrap();

        assert!(matches!(cache.get_new_node(), Err(StrataError::CacheFull)));
        assert!(cache.is_resident(a) && cache.is_resident(b));

        cache.unfix_node(b);
        let c = cache.get_new_node().unwrap();
        assert!(cache.is_resident(a));
        assert!(!cache.is_resident(b));
        assert!(cache.is_resident(c));
        cache.unfix_node(a);
        cache.unfix_node(c);
    }

    #[test]
    fn test_reentrant_fix() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Clock);
        let a = new_counter(&mut cache, 5);

        cache.get_node(a, true).unwrap();
        cache.get_node(a, true).unwrap();
        assert_eq!(cache.fix_count(a), Some(2));
        cache.unfix_node(a);
        cache.unfix_node(a);
        assert_eq!(cache.fix_count(a), Some(0));
    }

    #[test]
    #[should_panic(expected = "fix count is already zero")]
    fn test_double_unfix_panics() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
        let a = new_counter(&mut cache, 1);
        cache.unfix_node(a);
    }

    #[test]
    #[should_panic(expected = "with fix count 1")]
    fn test_delete_fixed_panics() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
        let a = cache.get_new_node().unwrap();
        let _ = cache.delete_node(a);
    }

    #[test]
    fn test_delete_frees_block() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
        let a = new_counter(&mut cache, 1);
        let used = bm.total_bytes() - bm.free_bytes();

        cache.delete_node(a).unwrap();
        assert!(!cache.is_resident(a));
        assert_eq!(bm.total_bytes() - bm.free_bytes(), used - BLOCK as u64);
        assert!(cache.delete_node(a).is_err());
    }

    #[test]
    fn test_prefetch_then_get() {
        let bm = Arc::new(BlockManager::in_memory(2).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
        let bids: Vec<Bid> = (0..4).map(|v| new_counter(&mut cache, v + 100)).collect();
        cache.flush().unwrap();

        assert!(!cache.is_resident(bids[0]));
        cache.prefetch_node(bids[0]).unwrap();
        assert!(cache.is_resident(bids[0]));
        assert_eq!(cache.fix_count(bids[0]), Some(0));

        let misses = cache.stats().misses;
        assert_eq!(cache.get_node(bids[0], false).unwrap().value, 100);
        assert_eq!(cache.stats().misses, misses);
        assert_eq!(cache.stats().prefetches, 1);
    }

    #[test]
    fn test_prefetch_evicted_before_use() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 1, ReplacementPolicy::Lru);
        let a = new_counter(&mut cache, 1);
        let b = new_counter(&mut cache, 2);

        cache.prefetch_node(a).unwrap();
        assert_eq!(cache.get_node(b, false).unwrap().value, 2);
        assert!(!cache.is_resident(a));
        assert_eq!(cache.get_node(a, false).unwrap().value, 1);
    }

    #[test]
    fn test_flush_writes_dirty_once() {
        let bm = Arc::new(BlockManager::in_memory(2).unwrap());
        let mut cache = cache_with(&bm, 8, ReplacementPolicy::Lru);
        let bids: Vec<Bid> = (0..6).map(|v| new_counter(&mut cache, v)).collect();

        assert_eq!(cache.flush().unwrap(), 6);
        assert_eq!(cache.flush().unwrap(), 0);
        assert_eq!(cache.stats().dirty, 0);

        for (v, &bid) in bids.iter().enumerate() {
            let raw = bm.read_block(bid, BLOCK).unwrap();
            assert_eq!(Counter::decode(bid, &raw).unwrap().value, v as u64);
        }
    }

    #[test]
    fn test_drop_writes_back() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let bid = {
            let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
            new_counter(&mut cache, 77)
        };
        let raw = bm.read_block(bid, BLOCK).unwrap();
        assert_eq!(Counter::decode(bid, &raw).unwrap().value, 77);
    }

    #[test]
    fn test_pair_mut() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 4, ReplacementPolicy::Lru);
        let a = new_counter(&mut cache, 1);
        let b = new_counter(&mut cache, 2);
        cache.flush().unwrap();

        let (x, y) = cache.pair_mut(b, a);
        std::mem::swap(&mut x.value, &mut y.value);
        assert_eq!(cache.node(a).value, 2);
        assert_eq!(cache.node(b).value, 1);
        assert!(cache.is_dirty(a) && cache.is_dirty(b));
    }

    #[test]
    fn test_stats_counts() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let mut cache = cache_with(&bm, 2, ReplacementPolicy::Lru);
        let a = new_counter(&mut cache, 1);
        cache.get_node(a, true).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.resident, 1);
        assert_eq!(stats.fixed, 1);
        assert_eq!(stats.dirty, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        cache.unfix_node(a);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let bm = Arc::new(BlockManager::in_memory(1).unwrap());
        let config = CacheConfig {
            capacity_blocks: 0,
            policy: ReplacementPolicy::Lru,
        };
        let strategy = make_strategy_seeded(StrategyKind::Striping, 1, 0).unwrap();
        assert!(NodeCache::<Counter>::new(bm, BLOCK, &config, strategy).is_err());
    }
}
