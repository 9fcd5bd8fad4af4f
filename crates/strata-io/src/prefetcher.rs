//! Pull-based block prefetcher.
//!
//! Blocks are delivered in consumption order while reads are issued in a
//! separately computed prefetch order, keeping at most `N` reads in flight.

use crate::block_manager::BlockManager;
use crate::request::{CompletionHandler, Request};
use crate::switch::OnOffSwitch;
use std::sync::Arc;
use strata_common::{Bid, Result, StrataError};
use tracing::debug;

enum SlotState {
    Idle(Vec<u8>),
    InFlight {
        block: usize,
        request: Request,
    },
    Ready {
        block: usize,
        data: Vec<u8>,
    },
    /// Transient while the state is being replaced.
    Empty,
}

struct Slot {
    state: SlotState,
    completed: Arc<OnOffSwitch>,
}

/// Reads a sequence of blocks through `N` recycled buffers.
pub struct BlockPrefetcher<'a> {
    manager: &'a BlockManager,
    bids: Vec<Bid>,
    block_size: usize,
    prefetch_order: Vec<usize>,
    /// Next position in `prefetch_order` to consider for issuing.
    next_prefetch: usize,
    issued: Vec<bool>,
    /// Slot holding each block while issued and unconsumed.
    slot_of: Vec<Option<usize>>,
    slots: Vec<Slot>,
    /// Next block index in consumption order.
    next_consume: usize,
}

impl<'a> BlockPrefetcher<'a> {
    /// Creates the prefetcher and immediately issues the first reads.
    ///
    /// `bids` is the consumption sequence; `prefetch_order` is a permutation
    /// of its indices (see `compute_prefetch_schedule`); `buffers` is the
    /// number of read buffers.
    pub fn new(
        manager: &'a BlockManager,
        bids: Vec<Bid>,
        block_size: usize,
        prefetch_order: Vec<usize>,
        buffers: usize,
    ) -> Result<Self> {
        if prefetch_order.len() != bids.len() {
            return Err(StrataError::invalid_parameter(
                "prefetch order length",
                prefetch_order.len(),
            ));
        }
        let mut seen = vec![false; bids.len()];
        for &i in &prefetch_order {
            if i >= bids.len() || std::mem::replace(&mut seen[i], true) {
                return Err(StrataError::invalid_parameter("prefetch order entry", i));
            }
        }
        if buffers == 0 {
            return Err(StrataError::invalid_parameter("buffers", 0));
        }

        let count = bids.len();
        let slots = (0..buffers.min(count.max(1)))
            .map(|_| Slot {
                state: SlotState::Idle(vec![0u8; block_size]),
                completed: Arc::new(OnOffSwitch::default()),
            })
            .collect();

        let mut prefetcher = Self {
            manager,
            bids,
            block_size,
            prefetch_order,
            next_prefetch: 0,
            issued: vec![false; count],
            slot_of: vec![None; count],
            slots,
            next_consume: 0,
        };
        for slot in 0..prefetcher.slots.len() {
            prefetcher.issue_into(slot)?;
        }
        debug!(
            blocks = count,
            buffers = prefetcher.slots.len(),
            "prefetcher started"
        );
        Ok(prefetcher)
    }

    /// Picks the next block to read into a free slot: the next block to be
    /// consumed if it is not issued yet, otherwise the next unissued block
    /// in prefetch order.
    fn next_to_issue(&mut self) -> Option<usize> {
        if self.next_consume < self.bids.len() && !self.issued[self.next_consume] {
            return Some(self.next_consume);
        }
        while self.next_prefetch < self.prefetch_order.len() {
            let block = self.prefetch_order[self.next_prefetch];
            self.next_prefetch += 1;
            if !self.issued[block] {
                return Some(block);
            }
        }
        None
    }

    fn issue_into(&mut self, slot: usize) -> Result<()> {
        let Some(block) = self.next_to_issue() else {
            return Ok(());
        };
        let buffer = match std::mem::replace(&mut self.slots[slot].state, SlotState::Empty) {
            SlotState::Idle(buffer) => buffer,
            SlotState::Ready { data, .. } => data,
            other => {
                self.slots[slot].state = other;
                return Err(StrataError::Internal(format!(
                    "prefetch slot {slot} is still in use"
                )));
            }
        };

        let completed = Arc::clone(&self.slots[slot].completed);
        completed.off();
        let handler: CompletionHandler = Box::new(move |_| completed.on());
        let request = match self
            .manager
            .aread_block(self.bids[block], buffer, Some(handler))
        {
            Ok(request) => request,
            Err(e) => {
                self.slots[slot].state = SlotState::Idle(vec![0u8; self.block_size]);
                return Err(e);
            }
        };

        self.issued[block] = true;
        self.slot_of[block] = Some(slot);
        self.slots[slot].state = SlotState::InFlight { block, request };
        Ok(())
    }

    /// Returns the next block in consumption order, waiting for its read.
    /// Returns `None` once every block was consumed.
    pub fn pull_block(&mut self) -> Result<Option<&[u8]>> {
        let block = self.next_consume;
        if block >= self.bids.len() {
            return Ok(None);
        }
        let slot = self.slot_of[block].ok_or_else(|| {
            StrataError::Internal(format!("block {block} pulled before it was issued"))
        })?;

        let pending = match &self.slots[slot].state {
            SlotState::InFlight { block: b, request } if *b == block => Some(request.clone()),
            _ => None,
        };
        if let Some(request) = pending {
            self.slots[slot].completed.wait_for_on();
            let data = request.wait_buffer()?;
            self.slots[slot].state = SlotState::Ready { block, data };
        }

        match &self.slots[slot].state {
            SlotState::Ready { block: b, data } if *b == block => Ok(Some(data.as_slice())),
            _ => Err(StrataError::Internal(format!(
                "prefetch slot {slot} does not hold block {block}"
            ))),
        }
    }

    /// Releases the current block's buffer and reuses it for the next
    /// scheduled read. Returns false once the sequence is exhausted.
    pub fn block_consumed(&mut self) -> Result<bool> {
        let block = self.next_consume;
        if block >= self.bids.len() {
            return Ok(false);
        }
        // Make sure the read finished before its buffer is reused.
        self.pull_block()?;
        let slot = self.slot_of[block]
            .take()
            .ok_or_else(|| StrataError::Internal(format!("block {block} was never issued")))?;

        self.next_consume += 1;
        self.issue_into(slot)?;
        Ok(self.next_consume < self.bids.len())
    }

    /// Number of blocks in the consumption sequence.
    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    /// Number of blocks already consumed.
    pub fn consumed(&self) -> usize {
        self.next_consume
    }

    /// Number of reads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| match &s.state {
                SlotState::InFlight { request, .. } => !request.poll().unwrap_or(true),
                _ => false,
            })
            .count()
    }

    /// Number of read buffers.
    pub fn buffers(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for BlockPrefetcher<'_> {
    fn drop(&mut self) {
        // No read outlives the prefetcher.
        for slot in &self.slots {
            if let SlotState::InFlight { request, .. } = &slot.state {
                if let Err(e) = request.wait() {
                    debug!(error = %e, "prefetch read failed after the prefetcher was dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::compute_prefetch_schedule;
    use crate::strategy::Striping;

    const BLOCK: usize = 512;

    fn setup(disks: usize, count: usize) -> (BlockManager, Vec<Bid>) {
        let bm = BlockManager::in_memory(disks).unwrap();
        let mut strategy = Striping::new(disks);
        let bids = bm.new_blocks(&mut strategy, BLOCK, count, 0).unwrap();
        let blocks = bids
            .iter()
            .enumerate()
            .map(|(i, &bid)| (bid, vec![i as u8; BLOCK]))
            .collect();
        bm.write_blocks(blocks).unwrap();
        (bm, bids)
    }

    fn consume_all(prefetcher: &mut BlockPrefetcher<'_>) -> Vec<u8> {
        let mut seen = Vec::new();
        loop {
            let Some(block) = prefetcher.pull_block().unwrap() else {
                break;
            };
            assert!(block.iter().all(|&b| b == block[0]));
            seen.push(block[0]);
            if !prefetcher.block_consumed().unwrap() {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_prefetch_in_consumption_order() {
        let (bm, bids) = setup(3, 20);
        let disks: Vec<_> = bids.iter().map(|b| bm.disk_of(*b).unwrap()).collect();
        let order = compute_prefetch_schedule(&disks, 3, 4);

        let mut prefetcher = BlockPrefetcher::new(&bm, bids, BLOCK, order, 4).unwrap();
        assert_eq!(prefetcher.buffers(), 4);
        assert!(prefetcher.in_flight() <= 4);

        let seen = consume_all(&mut prefetcher);
        assert_eq!(seen, (0..20).collect::<Vec<u8>>());
        assert_eq!(prefetcher.consumed(), 20);
        assert!(prefetcher.pull_block().unwrap().is_none());
        assert!(!prefetcher.block_consumed().unwrap());
    }

    #[test]
    fn test_prefetch_reverse_order_does_not_starve() {
        let (bm, bids) = setup(2, 10);
        let order: Vec<usize> = (0..10).rev().collect();
        let mut prefetcher = BlockPrefetcher::new(&bm, bids, BLOCK, order, 3).unwrap();
        assert_eq!(consume_all(&mut prefetcher), (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_next_block_to_consume_is_issued_first() {
        let (bm, bids) = setup(2, 6);
        let order = vec![5, 4, 3, 2, 1, 0];
        let mut prefetcher = BlockPrefetcher::new(&bm, bids, BLOCK, order, 2).unwrap();
        // Block 0 goes ahead of the order, then the order resumes.
        assert!(prefetcher.issued[0]);
        assert!(prefetcher.issued[5]);
        assert_eq!(prefetcher.issued.iter().filter(|&&i| i).count(), 2);

        assert!(prefetcher.block_consumed().unwrap());
        assert!(prefetcher.issued[1]);
        assert!(!prefetcher.issued[4]);
        assert_eq!(consume_all(&mut prefetcher), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_prefetch_more_buffers_than_blocks() {
        let (bm, bids) = setup(2, 3);
        let mut prefetcher = BlockPrefetcher::new(&bm, bids, BLOCK, vec![2, 1, 0], 8).unwrap();
        assert_eq!(prefetcher.buffers(), 3);
        assert_eq!(consume_all(&mut prefetcher), vec![0, 1, 2]);
    }

    #[test]
    fn test_prefetch_empty_sequence() {
        let bm = BlockManager::in_memory(1).unwrap();
        let mut prefetcher = BlockPrefetcher::new(&bm, Vec::new(), BLOCK, Vec::new(), 2).unwrap();
        assert!(prefetcher.is_empty());
        assert!(prefetcher.pull_block().unwrap().is_none());
        assert!(!prefetcher.block_consumed().unwrap());
    }

    #[test]
    fn test_prefetch_rejects_bad_order() {
        let (bm, bids) = setup(1, 3);
        assert!(BlockPrefetcher::new(&bm, bids.clone(), BLOCK, vec![0, 1], 2).is_err());
        assert!(BlockPrefetcher::new(&bm, bids.clone(), BLOCK, vec![0, 1, 1], 2).is_err());
        assert!(BlockPrefetcher::new(&bm, bids, BLOCK, vec![0, 1, 2], 0).is_err());
    }

    #[test]
    fn test_prefetch_repeated_pull_returns_same_block() {
        let (bm, bids) = setup(2, 4);
        let mut prefetcher = BlockPrefetcher::new(&bm, bids, BLOCK, vec![0, 1, 2, 3], 2).unwrap();
        assert_eq!(prefetcher.pull_block().unwrap().unwrap()[0], 0);
        assert_eq!(prefetcher.pull_block().unwrap().unwrap()[0], 0);
        assert!(prefetcher.block_consumed().unwrap());
        assert_eq!(prefetcher.pull_block().unwrap().unwrap()[0], 1);
    }
}
