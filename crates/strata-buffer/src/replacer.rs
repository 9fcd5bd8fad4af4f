//! Replacement policies for the node cache.

use crate::slot::SlotId;
use std::collections::BTreeMap;
use strata_common::ReplacementPolicy;

/// Chooses which unfixed slot gives up its block when the cache is full.
pub trait Replacer: Send {
    /// Records a use of `slot`.
    fn record_access(&mut self, slot: SlotId);

    /// Adds `slot` to, or removes it from, the eviction candidates.
    fn set_evictable(&mut self, slot: SlotId, evictable: bool);

    /// Picks and removes a victim. Returns None if nothing is evictable.
    fn evict(&mut self) -> Option<SlotId>;

    /// Forgets `slot` entirely.
    fn remove(&mut self, slot: SlotId);

    /// Number of evictable slots.
    fn size(&self) -> usize;
}

/// Builds the replacer for `policy` over `capacity` slots.
pub fn make_replacer(policy: ReplacementPolicy, capacity: usize) -> Box<dyn Replacer> {
    match policy {
        ReplacementPolicy::Lru => Box::new(LruReplacer::new(capacity)),
        ReplacementPolicy::Clock => Box::new(ClockReplacer::new(capacity)),
    }
}

/// Evicts the evictable slot whose last access or release is oldest.
pub struct LruReplacer {
    tick: u64,
    last_access: Vec<u64>,
    evictable: Vec<bool>,
    /// Evictable slots by last access.
    queue: BTreeMap<u64, SlotId>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            tick: 0,
            last_access: vec![0; capacity],
            evictable: vec![false; capacity],
            queue: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.last_access.len()
    }

    fn in_range(&self, slot: SlotId) -> bool {
        slot.index() < self.last_access.len()
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, slot: SlotId) {
        if !self.in_range(slot) {
            return;
        }
        let i = slot.index();
        self.tick += 1;
        if self.evictable[i] {
            self.queue.remove(&self.last_access[i]);
            self.queue.insert(self.tick, slot);
        }
        self.last_access[i] = self.tick;
    }

    fn set_evictable(&mut self, slot: SlotId, evictable: bool) {
        if !self.in_range(slot) {
            return;
        }
        let i = slot.index();
        if self.evictable[i] == evictable {
            return;
        }
        self.evictable[i] = evictable;
        if evictable {
            // Releasing a slot counts as its latest use.
            self.tick += 1;
            self.last_access[i] = self.tick;
            self.queue.insert(self.tick, slot);
        } else {
            self.queue.remove(&self.last_access[i]);
        }
    }

    fn evict(&mut self) -> Option<SlotId> {
        let (_, slot) = self.queue.pop_first()?;
        self.evictable[slot.index()] = false;
        Some(slot)
    }

    fn remove(&mut self, slot: SlotId) {
        self.set_evictable(slot, false);
    }

    fn size(&self) -> usize {
        self.queue.len()
    }
}

/// Second-chance clock over the slot array.
///
/// The hand sweeps the slots; an evictable slot with its reference bit set
/// loses the bit and is skipped, one without it is the victim.
pub struct ClockReplacer {
    reference_bits: Vec<bool>,
    evictable: Vec<bool>,
    num_evictable: usize,
    hand: usize,
}

impl ClockReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            reference_bits: vec![false; capacity],
            evictable: vec![false; capacity],
            num_evictable: 0,
            hand: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.evictable.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&mut self, slot: SlotId) {
        if let Some(bit) = self.reference_bits.get_mut(slot.index()) {
            *bit = true;
        }
    }

    fn set_evictable(&mut self, slot: SlotId, evictable: bool) {
        let Some(current) = self.evictable.get_mut(slot.index()) else {
            return;
        };
        if *current != evictable {
            *current = evictable;
            if evictable {
                self.num_evictable += 1;
            } else {
                self.num_evictable -= 1;
            }
        }
    }

    fn evict(&mut self) -> Option<SlotId> {
        if self.num_evictable == 0 {
            return None;
        }
        let n = self.evictable.len();
        // Two sweeps clear every reference bit, so a victim is always found.
        for _ in 0..2 * n {
            let hand = self.hand;
            self.hand = (hand + 1) % n;
            if !self.evictable[hand] {
                continue;
            }
            if self.reference_bits[hand] {
                self.reference_bits[hand] = false;
            } else {
                self.evictable[hand] = false;
                self.num_evictable -= 1;
                return Some(SlotId(hand as u32));
            }
        }
        None
    }

    fn remove(&mut self, slot: SlotId) {
        self.set_evictable(slot, false);
        if let Some(bit) = self.reference_bits.get_mut(slot.index()) {
            *bit = false;
        }
    }

    fn size(&self) -> usize {
        self.num_evictable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_evicts_least_recent() {
        let mut lru = LruReplacer::new(4);
        for i in 0..4 {
            lru.record_access(SlotId(i));
            lru.set_evictable(SlotId(i), true);
        }
        lru.record_access(SlotId(0));

        assert_eq!(lru.evict(), Some(SlotId(1)));
        assert_eq!(lru.evict(), Some(SlotId(2)));
        assert_eq!(lru.evict(), Some(SlotId(3)));
        assert_eq!(lru.evict(), Some(SlotId(0)));
        assert_eq!(lru.evict(), None);
    }

    #[test]
    fn test_lru_skips_non_evictable() {
        let mut lru = LruReplacer::new(3);
        for i in 0..3 {
            lru.record_access(SlotId(i));
            lru.set_evictable(SlotId(i), true);
        }
        lru.set_evictable(SlotId(0), false);
        assert_eq!(lru.size(), 2);
        assert_eq!(lru.evict(), Some(SlotId(1)));

        lru.remove(SlotId(2));
        assert_eq!(lru.size(), 0);
        assert_eq!(lru.evict(), None);
    }

    #[test]
    fn test_lru_access_while_pinned_counts() {
        let mut lru = LruReplacer::new(2);
        lru.record_access(SlotId(0));
        lru.record_access(SlotId(1));
        lru.set_evictable(SlotId(1), true);
        // Touched while not evictable, then released.
        lru.record_access(SlotId(0));
        lru.set_evictable(SlotId(0), true);
        assert_eq!(lru.evict(), Some(SlotId(1)));
    }

    #[test]
    fn test_lru_out_of_range_ignored() {
        let mut lru = LruReplacer::new(2);
        lru.set_evictable(SlotId(9), true);
        lru.record_access(SlotId(9));
        lru.remove(SlotId(9));
        assert_eq!(lru.size(), 0);
        assert_eq!(lru.capacity(), 2);
    }

    #[test]
    fn test_clock_replacer_evict_empty() {
        let mut clock = ClockReplacer::new(10);
        assert_eq!(clock.capacity(), 10);
        assert!(clock.evict().is_none());
    }

    #[test]
    fn test_clock_replacer_second_chance() {
        let mut clock = ClockReplacer::new(3);
        for i in 0..3 {
            clock.set_evictable(SlotId(i), true);
        }
        clock.record_access(SlotId(0));
        clock.record_access(SlotId(1));
        assert_eq!(clock.evict(), Some(SlotId(2)));
        assert_eq!(clock.size(), 2);
    }

    #[test]
    fn test_clock_replacer_all_referenced() {
        let mut clock = ClockReplacer::new(3);
        for i in 0..3 {
            clock.set_evictable(SlotId(i), true);
            clock.record_access(SlotId(i));
        }
        assert!(clock.evict().is_some());
        assert_eq!(clock.size(), 2);
    }

    #[test]
    fn test_clock_replacer_pin_unpin_cycle() {
        let mut clock = ClockReplacer::new(3);
        for i in 0..3 {
            clock.set_evictable(SlotId(i), true);
        }
        clock.set_evictable(SlotId(1), false);
        assert_eq!(clock.size(), 2);

        let victim = clock.evict();
        assert!(victim.is_some());
        assert_ne!(victim, Some(SlotId(1)));

        clock.set_evictable(SlotId(1), true);
        assert_eq!(clock.size(), 2);
        clock.remove(SlotId(1));
        assert_eq!(clock.size(), 1);
    }

    #[test]
    fn test_make_replacer() {
        for policy in [ReplacementPolicy::Lru, ReplacementPolicy::Clock] {
            let mut r = make_replacer(policy, 4);
            r.set_evictable(SlotId(3), true);
            assert_eq!(r.size(), 1);
            assert_eq!(r.evict(), Some(SlotId(3)));
        }
    }
}
