//! Leaf blocks: sorted key/value entries chained to their neighbours.
//!
//! Block layout:
//! ```text
//! +------------------------+ 0
//! | magic: u32             |
//! | count: u32             |
//! | pred: Bid (12 bytes)   |
//! | succ: Bid (12 bytes)   |
//! +------------------------+ 32 (LeafHeader::SIZE)
//! | key_0 | value_0        |
//! | key_1 | value_1        |
//! | ...                    |
//! +------------------------+
//! ```

use crate::codec::FixedCodec;
use bytes::{Buf, BufMut};
use strata_buffer::CachedBlock;
use strata_common::{Bid, Result, StrataError};

const LEAF_MAGIC: u32 = 0x5354_4C46;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeafHeader {
    count: u32,
    pred: Bid,
    succ: Bid,
}

impl LeafHeader {
    const SIZE: usize = 4 + 4 + 2 * Bid::ENCODED_SIZE;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(LEAF_MAGIC);
        buf.put_u32_le(self.count);
        self.pred.encode(buf);
        self.succ.encode(buf);
    }

    fn decode<B: Buf>(bid: Bid, buf: &mut B) -> Result<Self> {
        let magic = buf.get_u32_le();
        if magic != LEAF_MAGIC {
            return Err(StrataError::Corrupted {
                bid,
                reason: format!("bad leaf magic {magic:#010x}"),
            });
        }
        Ok(Self {
            count: buf.get_u32_le(),
            pred: Bid::decode(buf),
            succ: Bid::decode(buf),
        })
    }
}

/// A leaf of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf<K, V> {
    bid: Bid,
    pred: Bid,
    succ: Bid,
    entries: Vec<(K, V)>,
}

impl<K: FixedCodec + Ord, V: FixedCodec> Leaf<K, V> {
    const ENTRY_SIZE: usize = K::ENCODED_SIZE + V::ENCODED_SIZE;

    /// Entries that fit in a block of `block_size` bytes.
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(LeafHeader::SIZE) / Self::ENTRY_SIZE
    }

    pub fn bid(&self) -> Bid {
        self.bid
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pred(&self) -> Bid {
        self.pred
    }

    pub fn succ(&self) -> Bid {
        self.succ
    }

    pub fn set_pred(&mut self, pred: Bid) {
        self.pred = pred;
    }

    pub fn set_succ(&mut self, succ: Bid) {
        self.succ = succ;
    }

    pub fn entries(&self) -> &[(K, V)] {
        &self.entries
    }

    pub fn key(&self, pos: usize) -> &K {
        &self.entries[pos].0
    }

    pub fn value(&self, pos: usize) -> &V {
        &self.entries[pos].1
    }

    pub fn entry(&self, pos: usize) -> Option<&(K, V)> {
        self.entries.get(pos)
    }

    /// Largest key, if any.
    pub fn max_key(&self) -> Option<&K> {
        self.entries.last().map(|(k, _)| k)
    }

    /// Position of `key`, or where it would be inserted.
    pub fn search(&self, key: &K) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    /// Position of the first key greater than `key`.
    pub fn upper_position(&self, key: &K) -> usize {
        self.entries.partition_point(|(k, _)| k <= key)
    }

    pub fn insert_at(&mut self, pos: usize, key: K, value: V) {
        self.entries.insert(pos, (key, value));
    }

    pub fn remove_at(&mut self, pos: usize) -> (K, V) {
        self.entries.remove(pos)
    }

    pub fn set_value(&mut self, pos: usize, value: V) {
        self.entries[pos].1 = value;
    }

    pub fn push(&mut self, key: K, value: V) {
        self.entries.push((key, value));
    }

    /// Removes and returns the first `n` entries.
    pub fn take_front(&mut self, n: usize) -> Vec<(K, V)> {
        self.entries.drain(..n).collect()
    }

    /// Removes and returns the last `n` entries.
    pub fn take_back(&mut self, n: usize) -> Vec<(K, V)> {
        let at = self.entries.len() - n;
        self.entries.split_off(at)
    }

    pub fn take_entries(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.entries)
    }

    pub fn prepend(&mut self, mut front: Vec<(K, V)>) {
        front.append(&mut self.entries);
        self.entries = front;
    }

    pub fn append(&mut self, mut back: Vec<(K, V)>) {
        self.entries.append(&mut back);
    }
}

impl<K: FixedCodec + Ord, V: FixedCodec> CachedBlock for Leaf<K, V> {
    fn empty(bid: Bid) -> Self {
        Self {
            bid,
            pred: Bid::INVALID,
            succ: Bid::INVALID,
            entries: Vec::new(),
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let needed = LeafHeader::SIZE + self.entries.len() * Self::ENTRY_SIZE;
        if needed > buf.len() {
            return Err(StrataError::BlockSizeMismatch {
                expected: buf.len(),
                actual: needed,
            });
        }
        let mut out = buf;
        LeafHeader {
            count: self.entries.len() as u32,
            pred: self.pred,
            succ: self.succ,
        }
        .encode(&mut out);
        for (key, value) in &self.entries {
            key.encode(&mut out);
            value.encode(&mut out);
        }
        Ok(())
    }

    fn decode(bid: Bid, buf: &[u8]) -> Result<Self> {
        if buf.len() < LeafHeader::SIZE {
            return Err(StrataError::BlockSizeMismatch {
                expected: LeafHeader::SIZE,
                actual: buf.len(),
            });
        }
        let mut input = buf;
        let header = LeafHeader::decode(bid, &mut input)?;
        let count = header.count as usize;
        if count > Self::capacity(buf.len()) {
            return Err(StrataError::Corrupted {
                bid,
                reason: format!("leaf count {count} exceeds block capacity"),
            });
        }
        let entries = (0..count)
            .map(|_| {
                let key = K::decode(&mut input);
                let value = V::decode(&mut input);
                (key, value)
            })
            .collect();
        Ok(Self {
            bid,
            pred: header.pred,
            succ: header.succ,
            entries,
        })
    }
}
