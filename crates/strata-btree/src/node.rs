//! Internal node blocks.
//!
//! A node with `n` separator keys routes to `n + 1` children. Child `i`
//! holds the keys `k` with `keys[i - 1] < k <= keys[i]`; the first child
//! has no lower bound and the last no upper bound.
//!
//! Block layout:
//! ```text
//! +------------------------+ 0
//! | magic: u32             |
//! | level: u32             |
//! | num_keys: u32          |
//! +------------------------+ 12 (NodeHeader::SIZE)
//! | key_0 .. key_{n-1}     |
//! | child_0 .. child_n     |
//! +------------------------+
//! ```

use crate::codec::FixedCodec;
use bytes::{Buf, BufMut};
use strata_buffer::CachedBlock;
use strata_common::{Bid, Result, StrataError};

const NODE_MAGIC: u32 = 0x5354_4E44;

struct NodeHeader {
    level: u32,
    num_keys: u32,
}

impl NodeHeader {
    const SIZE: usize = 12;
}

/// An internal node. Level 1 nodes point at leaves.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<K> {
    bid: Bid,
    level: u32,
    keys: Vec<K>,
    children: Vec<Bid>,
}

impl<K: FixedCodec + Ord> Node<K> {
    /// Separator keys that fit in a block of `block_size` bytes.
    pub fn capacity(block_size: usize) -> usize {
        block_size.saturating_sub(NodeHeader::SIZE + Bid::ENCODED_SIZE)
            / (K::ENCODED_SIZE + Bid::ENCODED_SIZE)
    }

    pub fn bid(&self) -> Bid {
        self.bid
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn children(&self) -> &[Bid] {
        &self.children
    }

    pub fn key(&self, i: usize) -> &K {
        &self.keys[i]
    }

    pub fn child(&self, i: usize) -> Bid {
        self.children[i]
    }

    /// Index of the child whose range holds `key`.
    pub fn child_index(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k < key)
    }

    /// Replaces the contents.
    pub fn fill(&mut self, level: u32, keys: Vec<K>, children: Vec<Bid>) {
        debug_assert_eq!(keys.len() + 1, children.len());
        self.level = level;
        self.keys = keys;
        self.children = children;
    }

    /// Takes keys and children, leaving the node empty.
    pub fn take(&mut self) -> (Vec<K>, Vec<Bid>) {
        (
            std::mem::take(&mut self.keys),
            std::mem::take(&mut self.children),
        )
    }

    /// Inserts the left half of a split child: `left` now covers the keys up
    /// to `splitter`, the child previously at `index` keeps the rest.
    pub fn insert_split(&mut self, index: usize, splitter: K, left: Bid) {
        self.keys.insert(index, splitter);
        self.children.insert(index, left);
    }

    /// Removes child `index` together with the separator to its right.
    pub fn remove_child(&mut self, index: usize) {
        self.keys.remove(index);
        self.children.remove(index);
    }

    pub fn set_key(&mut self, index: usize, key: K) {
        self.keys[index] = key;
    }

    /// Splits off the lower half. Returns the separator that moves up and
    /// the keys and children of the new left sibling.
    pub fn split_front(&mut self) -> (K, Vec<K>, Vec<Bid>) {
        let mid = self.keys.len() / 2;
        let left_keys: Vec<K> = self.keys.drain(..mid).collect();
        let splitter = self.keys.remove(0);
        let left_children: Vec<Bid> = self.children.drain(..=mid).collect();
        (splitter, left_keys, left_children)
    }
}

impl<K: FixedCodec + Ord> CachedBlock for Node<K> {
    fn empty(bid: Bid) -> Self {
        Self {
            bid,
            level: 0,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<()> {
        let needed = NodeHeader::SIZE
            + self.keys.len() * K::ENCODED_SIZE
            + self.children.len() * Bid::ENCODED_SIZE;
        if needed > buf.len() {
            return Err(StrataError::BlockSizeMismatch {
                expected: buf.len(),
                actual: needed,
            });
        }
        let header = NodeHeader {
            level: self.level,
            num_keys: self.keys.len() as u32,
        };
        let mut out = buf;
        out.put_u32_le(NODE_MAGIC);
        out.put_u32_le(header.level);
        out.put_u32_le(header.num_keys);
        for key in &self.keys {
            key.encode(&mut out);
        }
        for child in &self.children {
            child.encode(&mut out);
        }
        Ok(())
    }

    fn decode(bid: Bid, buf: &[u8]) -> Result<Self> {
        if buf.len() < NodeHeader::SIZE {
            return Err(StrataError::BlockSizeMismatch {
                expected: NodeHeader::SIZE,
                actual: buf.len(),
            });
        }
        let mut input = buf;
        let magic = input.get_u32_le();
        if magic != NODE_MAGIC {
            return Err(StrataError::Corrupted {
                bid,
                reason: format!("bad node magic {magic:#010x}"),
            });
        }
        let header = NodeHeader {
            level: input.get_u32_le(),
            num_keys: input.get_u32_le(),
        };
        let n = header.num_keys as usize;
        if n > Self::capacity(buf.len()) {
            return Err(StrataError::Corrupted {
                bid,
                reason: format!("node key count {n} exceeds block capacity"),
            });
        }
        let keys = (0..n).map(|_| K::decode(&mut input)).collect();
        let children = (0..=n).map(|_| Bid::decode(&mut input)).collect();
        Ok(Self {
            bid,
            level: header.level,
            keys,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(keys: &[u64]) -> Node<u64> {
        let children = (0..=keys.len() as u64).map(|i| Bid::new(0, i * 512)).collect();
        let mut n = Node::empty(Bid::new(1, 0));
        n.fill(1, keys.to_vec(), children);
        n
    }

    #[test]
    fn test_capacity() {
        // 12 header + 12 first child, then 8 + 12 per key.
        assert_eq!(Node::<u64>::capacity(24 + 20 * 7), 7);
        assert_eq!(Node::<u64>::capacity(10), 0);
    }

    #[test]
    fn test_child_index_routes_inclusive_upper() {
        let n = node(&[10, 20, 30]);
        assert_eq!(n.child_index(&5), 0);
        assert_eq!(n.child_index(&10), 0);
        assert_eq!(n.child_index(&11), 1);
        assert_eq!(n.child_index(&30), 2);
        assert_eq!(n.child_index(&31), 3);
        assert_eq!(n.child_index(&u64::MAX), 3);
    }

    #[test]
    fn test_encode_decode_block() {
        let n = node(&[3, 7, u64::MAX]);
        let mut block = vec![0u8; 256];
        n.encode(&mut block).unwrap();
        assert_eq!(Node::<u64>::decode(Bid::new(1, 0), &block).unwrap(), n);
    }

    #[test]
    fn test_decode_rejects_leaf_bytes() {
        let mut block = vec![0u8; 64];
        block[..4].copy_from_slice(&0x5354_4C46u32.to_le_bytes());
        assert!(matches!(
            Node::<u64>::decode(Bid::new(0, 0), &block),
            Err(StrataError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_split_front() {
        let mut n = node(&[10, 20, 30, 40, 50]);
        let (splitter, keys, children) = n.split_front();
        assert_eq!(splitter, 30);
        assert_eq!(keys, vec![10, 20]);
        assert_eq!(children.len(), 3);
        assert_eq!(n.keys(), &[40, 50]);
        assert_eq!(n.num_children(), 3);
    }

    #[test]
    fn test_insert_split_and_remove_child() {
        let mut n = node(&[20]);
        let right = n.child(0);
        n.insert_split(0, 10, Bid::new(2, 0));
        assert_eq!(n.keys(), &[10, 20]);
        assert_eq!(n.child(0), Bid::new(2, 0));
        assert_eq!(n.child(1), right);

        n.remove_child(0);
        assert_eq!(n.keys(), &[20]);
        assert_eq!(n.child(0), right);
    }
}
