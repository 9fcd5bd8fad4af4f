//! External B+ tree over cached node and leaf blocks.
//!
//! The root is always an internal node, kept fixed in the node cache for
//! the lifetime of the tree; an empty tree is a root with a single empty
//! leaf. Leaves are chained in key order. Every structural change to a
//! leaf moves the affected cursors through the iterator map, so a cursor
//! keeps denoting the same entry until that entry is erased.

use crate::codec::FixedCodec;
use crate::cursor::Cursor;
use crate::iterator_map::{CursorPos, IteratorMap};
use crate::leaf::Leaf;
use crate::node::Node;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use strata_buffer::{NodeCache, NodeCacheStats};
use strata_common::{BTreeConfig, Bid, Result, StrataError};
use strata_io::{make_strategy, BlockManager};
use tracing::{debug, info, warn};

/// Upper end of a position range: "to the end of the leaf".
const LAST: usize = usize::MAX;

/// A child split in two: `left` is the new block holding keys up to `key`.
struct Split<K> {
    key: K,
    left: Bid,
}

/// Where an inserted (or found) entry ended up.
struct Placed {
    leaf: Bid,
    pos: usize,
    inserted: bool,
}

type NodeParts<K> = (Vec<K>, Vec<Bid>);

/// Contents of two sibling nodes after joining them around their separator.
enum Joined<K> {
    /// Everything fits one node.
    One(NodeParts<K>),
    /// Redistributed halves and the separator between them.
    Two {
        left: NodeParts<K>,
        separator: K,
        right: NodeParts<K>,
    },
}

fn join_nodes<K>(left: NodeParts<K>, separator: K, right: NodeParts<K>, max_keys: usize) -> Joined<K> {
    let (mut keys, mut children) = left;
    keys.push(separator);
    keys.extend(right.0);
    children.extend(right.1);
    if keys.len() <= max_keys {
        return Joined::One((keys, children));
    }
    let mid = keys.len() / 2;
    let right_keys = keys.split_off(mid + 1);
    let separator = keys.remove(mid);
    let right_children = children.split_off(mid + 1);
    Joined::Two {
        left: (keys, children),
        separator,
        right: (right_keys, right_children),
    }
}

/// Entries per block when filling to `factor` of `max`.
fn fill_count(max: usize, factor: f64) -> usize {
    ((max as f64 * factor) as usize).clamp(1, max)
}

fn corrupted(bid: Bid, reason: impl Into<String>) -> StrataError {
    StrataError::Corrupted {
        bid,
        reason: reason.into(),
    }
}

/// Size and cache figures of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeStats {
    pub len: usize,
    pub height: usize,
    pub max_leaf_entries: usize,
    pub max_node_keys: usize,
    pub cursors: usize,
    pub node_cache: NodeCacheStats,
    pub leaf_cache: NodeCacheStats,
}

/// Ordered map from `K` to `V` stored in external memory.
///
/// Keys are unique. Height counts the leaf level, so a tree whose root
/// points straight at leaves has height 2. The tree owns its blocks and
/// frees them when dropped.
pub struct BTree<K: FixedCodec + Ord, V: FixedCodec> {
    config: BTreeConfig,
    nodes: NodeCache<Node<K>>,
    leaves: NodeCache<Leaf<K, V>>,
    iterators: Rc<RefCell<IteratorMap>>,
    root: Bid,
    height: usize,
    len: usize,
    max_leaf: usize,
    min_leaf: usize,
    max_node: usize,
    min_node: usize,
}

impl<K: FixedCodec + Ord, V: FixedCodec> BTree<K, V> {
    /// Creates an empty tree.
    pub fn new(manager: Arc<BlockManager>, config: BTreeConfig) -> Result<Self> {
        let mut tree = Self::open(manager, config)?;
        tree.init_root()?;
        debug!(
            max_leaf = tree.max_leaf,
            max_node = tree.max_node,
            "btree created"
        );
        Ok(tree)
    }

    /// Sets up caches and limits without allocating any block.
    fn open(manager: Arc<BlockManager>, config: BTreeConfig) -> Result<Self> {
        config.validate()?;
        let max_leaf = Leaf::<K, V>::capacity(config.leaf_block_size);
        if max_leaf < 3 {
            return Err(StrataError::invalid_parameter(
                "leaf_block_size",
                config.leaf_block_size,
            ));
        }
        let max_node = Node::<K>::capacity(config.node_block_size);
        if max_node < 3 {
            return Err(StrataError::invalid_parameter(
                "node_block_size",
                config.node_block_size,
            ));
        }

        let disks = manager.num_disks();
        let nodes = NodeCache::new(
            Arc::clone(&manager),
            config.node_block_size,
            &config.node_cache,
            make_strategy(config.strategy, disks)?,
        )?;
        let leaves = NodeCache::new(
            manager,
            config.leaf_block_size,
            &config.leaf_cache,
            make_strategy(config.strategy, disks)?,
        )?;

        Ok(Self {
            config,
            nodes,
            leaves,
            iterators: Rc::new(RefCell::new(IteratorMap::new())),
            root: Bid::INVALID,
            height: 0,
            len: 0,
            max_leaf,
            min_leaf: max_leaf / 2,
            max_node,
            min_node: max_node / 2,
        })
    }

    fn init_root(&mut self) -> Result<()> {
        let leaf = self.leaves.get_new_node()?;
        self.leaves.unfix_node(leaf);
        // The root stays fixed until it is replaced or released.
        let root = self.nodes.get_new_node()?;
        self.nodes.node_mut(root).fill(1, Vec::new(), vec![leaf]);
        self.root = root;
        self.height = 2;
        self.len = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// Most entries a leaf holds.
    pub fn max_leaf_entries(&self) -> usize {
        self.max_leaf
    }

    /// Most separator keys a node holds.
    pub fn max_node_keys(&self) -> usize {
        self.max_node
    }

    pub fn stats(&self) -> BTreeStats {
        BTreeStats {
            len: self.len,
            height: self.height,
            max_leaf_entries: self.max_leaf,
            max_node_keys: self.max_node,
            cursors: self.iterators.borrow().len(),
            node_cache: self.nodes.stats(),
            leaf_cache: self.leaves.stats(),
        }
    }

    fn cursor(&self, pos: CursorPos) -> Cursor {
        Cursor::new(pos, &self.iterators)
    }

    fn check_cursor(&self, cursor: &Cursor) {
        assert!(
            cursor.belongs_to(&self.iterators),
            "cursor belongs to another tree"
        );
    }

    // -------------------------------------------------------------------
    // Navigation
    // -------------------------------------------------------------------

    /// Leaf whose key range holds `key`.
    fn find_leaf(&mut self, key: &K) -> Result<Bid> {
        let mut bid = self.root;
        for _ in 1..self.height {
            let node = self.nodes.get_node(bid, false)?;
            bid = node.child(node.child_index(key));
        }
        Ok(bid)
    }

    /// First or last leaf.
    fn edge_leaf(&mut self, last: bool) -> Result<Bid> {
        let mut bid = self.root;
        for _ in 1..self.height {
            let node = self.nodes.get_node(bid, false)?;
            bid = if last {
                node.child(node.num_children() - 1)
            } else {
                node.child(0)
            };
        }
        Ok(bid)
    }

    /// Turns "position `pos` of `leaf`" into a cursor position, moving past
    /// the end of the leaf onto its successor.
    fn normalize(&mut self, leaf: Bid, pos: usize) -> Result<CursorPos> {
        let node = self.leaves.get_node(leaf, false)?;
        if pos < node.len() {
            return Ok(CursorPos::At { leaf, pos });
        }
        let succ = node.succ();
        if !succ.is_valid() || self.leaves.get_node(succ, false)?.is_empty() {
            return Ok(CursorPos::End);
        }
        Ok(CursorPos::At { leaf: succ, pos: 0 })
    }

    fn last_pos(&mut self) -> Result<CursorPos> {
        let leaf = self.edge_leaf(true)?;
        let len = self.leaves.get_node(leaf, false)?.len();
        Ok(match len {
            0 => CursorPos::End,
            n => CursorPos::At { leaf, pos: n - 1 },
        })
    }

    /// Cursor at the smallest entry, or End for an empty tree.
    pub fn begin(&mut self) -> Result<Cursor> {
        let leaf = self.edge_leaf(false)?;
        let pos = self.normalize(leaf, 0)?;
        Ok(self.cursor(pos))
    }

    /// The past-the-end cursor.
    pub fn end(&self) -> Cursor {
        self.cursor(CursorPos::End)
    }

    pub fn first(&mut self) -> Result<Cursor> {
        self.begin()
    }

    /// Cursor at the largest entry, or End for an empty tree.
    pub fn last(&mut self) -> Result<Cursor> {
        let pos = self.last_pos()?;
        Ok(self.cursor(pos))
    }

    /// Cursor at `key`, or End.
    pub fn find(&mut self, key: &K) -> Result<Cursor> {
        let leaf = self.find_leaf(key)?;
        let pos = match self.leaves.get_node(leaf, false)?.search(key) {
            Ok(pos) => CursorPos::At { leaf, pos },
            Err(_) => CursorPos::End,
        };
        Ok(self.cursor(pos))
    }

    pub fn contains(&mut self, key: &K) -> Result<bool> {
        let leaf = self.find_leaf(key)?;
        Ok(self.leaves.get_node(leaf, false)?.search(key).is_ok())
    }

    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let leaf = self.find_leaf(key)?;
        let node = self.leaves.get_node(leaf, false)?;
        Ok(node.search(key).ok().map(|pos| node.value(pos).clone()))
    }

    /// Cursor at the first entry not less than `key`.
    pub fn lower_bound(&mut self, key: &K) -> Result<Cursor> {
        let leaf = self.find_leaf(key)?;
        let (Ok(pos) | Err(pos)) = self.leaves.get_node(leaf, false)?.search(key);
        let pos = self.normalize(leaf, pos)?;
        Ok(self.cursor(pos))
    }

    /// Cursor at the first entry greater than `key`.
    pub fn upper_bound(&mut self, key: &K) -> Result<Cursor> {
        let leaf = self.find_leaf(key)?;
        let pos = self.leaves.get_node(leaf, false)?.upper_position(key);
        let pos = self.normalize(leaf, pos)?;
        Ok(self.cursor(pos))
    }

    /// Entry under `cursor`, or None at End.
    pub fn entry(&mut self, cursor: &Cursor) -> Result<Option<(K, V)>> {
        self.check_cursor(cursor);
        match cursor.position() {
            CursorPos::End => Ok(None),
            CursorPos::At { leaf, pos } => {
                Ok(self.leaves.get_node(leaf, false)?.entry(pos).cloned())
            }
        }
    }

    pub fn key_at(&mut self, cursor: &Cursor) -> Result<Option<K>> {
        Ok(self.entry(cursor)?.map(|(k, _)| k))
    }

    pub fn value_at(&mut self, cursor: &Cursor) -> Result<Option<V>> {
        Ok(self.entry(cursor)?.map(|(_, v)| v))
    }

    /// Overwrites the value under `cursor`.
    pub fn set_value(&mut self, cursor: &Cursor, value: V) -> Result<()> {
        self.check_cursor(cursor);
        let CursorPos::At { leaf, pos } = cursor.position() else {
            return Err(StrataError::invalid_parameter("cursor", "end"));
        };
        self.leaves.get_node(leaf, false)?;
        let node = self.leaves.node_mut(leaf);
        if pos >= node.len() {
            return Err(corrupted(leaf, format!("cursor position {pos} out of range")));
        }
        node.set_value(pos, value);
        Ok(())
    }

    /// Moves `cursor` to the next entry. Returns false if it was at End.
    pub fn advance(&mut self, cursor: &mut Cursor) -> Result<bool> {
        self.check_cursor(cursor);
        let CursorPos::At { leaf, pos } = cursor.position() else {
            return Ok(false);
        };
        let next = self.normalize(leaf, pos + 1)?;
        cursor.set_position(next);
        Ok(true)
    }

    /// Moves `cursor` to the previous entry; End moves to the last entry.
    /// Returns false, leaving the cursor alone, at the first entry or in an
    /// empty tree.
    pub fn retreat(&mut self, cursor: &mut Cursor) -> Result<bool> {
        self.check_cursor(cursor);
        let prev = match cursor.position() {
            CursorPos::End => match self.last_pos()? {
                CursorPos::End => return Ok(false),
                last => last,
            },
            CursorPos::At { leaf, pos } if pos > 0 => CursorPos::At { leaf, pos: pos - 1 },
            CursorPos::At { leaf, .. } => {
                let pred = self.leaves.get_node(leaf, false)?.pred();
                if !pred.is_valid() {
                    return Ok(false);
                }
                let len = self.leaves.get_node(pred, false)?.len();
                CursorPos::At {
                    leaf: pred,
                    pos: len - 1,
                }
            }
        };
        cursor.set_position(prev);
        Ok(true)
    }

    /// Iterates all entries in key order.
    pub fn iter(&mut self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            start: None,
            leaf: Bid::INVALID,
            pos: 0,
            done: false,
        }
    }

    /// Iterates the entries not less than `key`.
    pub fn iter_from(&mut self, key: &K) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            start: Some(key.clone()),
            leaf: Bid::INVALID,
            pos: 0,
            done: false,
        }
    }

    // -------------------------------------------------------------------
    // Insertion
    // -------------------------------------------------------------------

    /// Inserts `key` unless present. Returns a cursor at the entry with
    /// `key` and whether it was inserted; an existing value is kept.
    pub fn insert(&mut self, key: K, value: V) -> Result<(Cursor, bool)> {
        self.insert_entry(key, value, false)
    }

    /// Inserts `key`, or overwrites its value. Returns true if inserted.
    pub fn insert_or_assign(&mut self, key: K, value: V) -> Result<(Cursor, bool)> {
        self.insert_entry(key, value, true)
    }

    fn insert_entry(&mut self, key: K, value: V, assign: bool) -> Result<(Cursor, bool)> {
        self.ensure_path_fits()?;
        let (placed, split) =
            self.insert_into_node(self.root, self.height - 1, key, value, assign)?;
        if let Some(split) = split {
            self.grow_root(split)?;
        }
        let cursor = self.cursor(CursorPos::At {
            leaf: placed.leaf,
            pos: placed.pos,
        });
        Ok((cursor, placed.inserted))
    }

    /// An update pins the node path plus one node: a new split node or
    /// the second sibling of a rebalance. Checked before anything changes.
    fn ensure_path_fits(&self) -> Result<()> {
        let available = self.nodes.capacity();
        if available < self.height {
            return Err(StrataError::CacheTooSmall {
                required: self.height,
                available,
            });
        }
        Ok(())
    }

    fn grow_root(&mut self, split: Split<K>) -> Result<()> {
        let root = self.nodes.get_new_node()?;
        self.nodes.node_mut(root).fill(
            self.height as u32,
            vec![split.key],
            vec![split.left, self.root],
        );
        let old = std::mem::replace(&mut self.root, root);
        self.nodes.unfix_node(old);
        self.height += 1;
        debug!(root = %root, height = self.height, "root split");
        Ok(())
    }

    fn insert_into_node(
        &mut self,
        bid: Bid,
        level: usize,
        key: K,
        value: V,
        assign: bool,
    ) -> Result<(Placed, Option<Split<K>>)> {
        let node = self.nodes.get_node(bid, true)?;
        let index = node.child_index(&key);
        let child = node.child(index);

        let below = if level == 1 {
            self.insert_into_leaf(child, key, value, assign)
        } else {
            self.insert_into_node(child, level - 1, key, value, assign)
        };
        let result = below.and_then(|(placed, split)| match split {
            None => Ok((placed, None)),
            Some(split) => {
                self.nodes
                    .node_mut(bid)
                    .insert_split(index, split.key, split.left);
                let up = if self.nodes.node(bid).num_keys() > self.max_node {
                    Some(self.split_node(bid)?)
                } else {
                    None
                };
                Ok((placed, up))
            }
        });
        self.nodes.unfix_node(bid);
        result
    }

    fn split_node(&mut self, bid: Bid) -> Result<Split<K>> {
        let left = self.nodes.get_new_node()?;
        let level = self.nodes.node(bid).level();
        let (key, keys, children) = self.nodes.node_mut(bid).split_front();
        self.nodes.node_mut(left).fill(level, keys, children);
        self.nodes.unfix_node(left);
        debug!(node = %bid, new = %left, level, "node split");
        Ok(Split { key, left })
    }

    fn insert_into_leaf(
        &mut self,
        bid: Bid,
        key: K,
        value: V,
        assign: bool,
    ) -> Result<(Placed, Option<Split<K>>)> {
        let search = self.leaves.get_node(bid, true)?.search(&key);
        let result = match search {
            Ok(pos) => {
                if assign {
                    self.leaves.node_mut(bid).set_value(pos, value);
                }
                Ok((
                    Placed {
                        leaf: bid,
                        pos,
                        inserted: false,
                    },
                    None,
                ))
            }
            Err(pos) => self.insert_new_entry(bid, pos, key, value),
        };
        self.leaves.unfix_node(bid);
        result
    }

    /// Inserts at `pos` of the fixed leaf `bid`, splitting it on overflow.
    fn insert_new_entry(
        &mut self,
        bid: Bid,
        pos: usize,
        key: K,
        value: V,
    ) -> Result<(Placed, Option<Split<K>>)> {
        self.leaves.node_mut(bid).insert_at(pos, key, value);
        self.iterators
            .borrow_mut()
            .rewrite(bid, pos, LAST, |p| CursorPos::At { leaf: bid, pos: p + 1 });
        self.len += 1;

        if self.leaves.node(bid).len() <= self.max_leaf {
            let placed = Placed {
                leaf: bid,
                pos,
                inserted: true,
            };
            return Ok((placed, None));
        }

        let (split, mid) = self.split_leaf(bid)?;
        let placed = if pos < mid {
            Placed {
                leaf: split.left,
                pos,
                inserted: true,
            }
        } else {
            Placed {
                leaf: bid,
                pos: pos - mid,
                inserted: true,
            }
        };
        Ok((placed, Some(split)))
    }

    /// Moves the lower half of the fixed leaf `bid` into a new left
    /// sibling. Returns the split and the number of entries moved.
    fn split_leaf(&mut self, bid: Bid) -> Result<(Split<K>, usize)> {
        let left = self.leaves.get_new_node()?;
        let (front, pred) = {
            let old = self.leaves.node_mut(bid);
            let mid = old.len() / 2;
            (old.take_front(mid), old.pred())
        };
        let mid = front.len();
        let key = front[mid - 1].0.clone();
        {
            let new = self.leaves.node_mut(left);
            new.append(front);
            new.set_pred(pred);
            new.set_succ(bid);
        }
        self.leaves.node_mut(bid).set_pred(left);
        {
            let mut map = self.iterators.borrow_mut();
            map.rewrite(bid, 0, mid - 1, |p| CursorPos::At { leaf: left, pos: p });
            map.rewrite(bid, mid, LAST, |p| CursorPos::At {
                leaf: bid,
                pos: p - mid,
            });
        }
        self.leaves.unfix_node(left);
        if pred.is_valid() {
            self.leaves.get_node(pred, false)?;
            self.leaves.node_mut(pred).set_succ(left);
        }
        debug!(leaf = %bid, new = %left, moved = mid, "leaf split");
        Ok((Split { key, left }, mid))
    }

    // -------------------------------------------------------------------
    // Erasure
    // -------------------------------------------------------------------

    /// Removes `key`. Returns the number of entries removed (0 or 1).
    pub fn erase(&mut self, key: &K) -> Result<usize> {
        self.ensure_path_fits()?;
        let erased = self.erase_from_node(self.root, self.height - 1, key)?;
        self.shrink_root()?;
        Ok(erased)
    }

    /// Removes the entry under `cursor`; the cursor becomes End.
    pub fn erase_at(&mut self, cursor: &Cursor) -> Result<()> {
        match self.key_at(cursor)? {
            Some(key) => self.erase(&key).map(|_| ()),
            None => Err(StrataError::invalid_parameter("cursor", "end")),
        }
    }

    fn erase_from_node(&mut self, bid: Bid, level: usize, key: &K) -> Result<usize> {
        let index = self.nodes.get_node(bid, true)?.child_index(key);
        let result = self.erase_below(bid, level, index, key);
        self.nodes.unfix_node(bid);
        result
    }

    fn erase_below(&mut self, bid: Bid, level: usize, index: usize, key: &K) -> Result<usize> {
        let (child, has_sibling) = {
            let node = self.nodes.node(bid);
            (node.child(index), node.num_children() > 1)
        };
        if level == 1 {
            let (erased, underflow) = self.erase_from_leaf(child, key)?;
            if underflow && has_sibling {
                self.rebalance_leaves(bid, index)?;
            }
            return Ok(erased);
        }

        let erased = self.erase_from_node(child, level - 1, key)?;
        if erased > 0
            && has_sibling
            && self.nodes.get_node(child, false)?.num_keys() < self.min_node
        {
            self.rebalance_nodes(bid, index)?;
        }
        Ok(erased)
    }

    /// Returns (erased, leaf underflowed).
    fn erase_from_leaf(&mut self, bid: Bid, key: &K) -> Result<(usize, bool)> {
        let Ok(pos) = self.leaves.get_node(bid, false)?.search(key) else {
            return Ok((0, false));
        };
        let remaining = {
            let leaf = self.leaves.node_mut(bid);
            leaf.remove_at(pos);
            leaf.len()
        };
        {
            let mut map = self.iterators.borrow_mut();
            map.rewrite(bid, pos, pos, |_| CursorPos::End);
            map.rewrite(bid, pos + 1, LAST, |p| CursorPos::At {
                leaf: bid,
                pos: p - 1,
            });
        }
        self.len -= 1;
        Ok((1, remaining < self.min_leaf))
    }

    /// Fixes the underflow of child `index` of `parent` by fusing it with a
    /// neighbour or moving entries over. The left neighbour is used unless
    /// the child is the first.
    fn rebalance_leaves(&mut self, parent: Bid, index: usize) -> Result<()> {
        let sep = index.saturating_sub(1);
        let (left, right) = {
            let node = self.nodes.node(parent);
            (node.child(sep), node.child(sep + 1))
        };
        self.leaves.get_node(left, true)?;
        if let Err(e) = self.leaves.get_node(right, true) {
            self.leaves.unfix_node(left);
            return Err(e);
        }

        let fused = self.merge_leaves(parent, sep, left, right);
        self.leaves.unfix_node(left);
        self.leaves.unfix_node(right);

        if let Some(pred) = fused {
            self.leaves.delete_node(left)?;
            if pred.is_valid() {
                self.leaves.get_node(pred, false)?;
                self.leaves.node_mut(pred).set_succ(right);
            }
        }
        Ok(())
    }

    /// Fuses `left` into `right`, or balances them. Both are fixed. On a
    /// fusion `left` is emptied and dropped from `parent`, and its former
    /// predecessor is returned.
    fn merge_leaves(&mut self, parent: Bid, sep: usize, left: Bid, right: Bid) -> Option<Bid> {
        let l = self.leaves.node(left).len();
        let r = self.leaves.node(right).len();

        if l + r <= self.max_leaf {
            let pred = {
                let (left_leaf, right_leaf) = self.leaves.pair_mut(left, right);
                let pred = left_leaf.pred();
                right_leaf.prepend(left_leaf.take_entries());
                right_leaf.set_pred(pred);
                pred
            };
            {
                let mut map = self.iterators.borrow_mut();
                map.rewrite(right, 0, LAST, |p| CursorPos::At {
                    leaf: right,
                    pos: p + l,
                });
                map.rewrite(left, 0, LAST, |p| CursorPos::At {
                    leaf: right,
                    pos: p,
                });
            }
            self.nodes.node_mut(parent).remove_child(sep);
            debug!(left = %left, right = %right, entries = l + r, "leaves fused");
            return Some(pred);
        }

        let target = (l + r) / 2;
        let mut map = self.iterators.borrow_mut();
        if l > target {
            let n = l - target;
            let (left_leaf, right_leaf) = self.leaves.pair_mut(left, right);
            right_leaf.prepend(left_leaf.take_back(n));
            map.rewrite(right, 0, LAST, |p| CursorPos::At {
                leaf: right,
                pos: p + n,
            });
            map.rewrite(left, target, LAST, |p| CursorPos::At {
                leaf: right,
                pos: p - target,
            });
        } else if l < target {
            let n = target - l;
            let (left_leaf, right_leaf) = self.leaves.pair_mut(left, right);
            left_leaf.append(right_leaf.take_front(n));
            map.rewrite(right, 0, n - 1, |p| CursorPos::At {
                leaf: left,
                pos: l + p,
            });
            map.rewrite(right, n, LAST, |p| CursorPos::At {
                leaf: right,
                pos: p - n,
            });
        }
        drop(map);

        if let Some(key) = self.leaves.node(left).max_key().cloned() {
            self.nodes.node_mut(parent).set_key(sep, key);
        }
        debug!(left = %left, right = %right, left_len = target, "leaves balanced");
        None
    }

    fn rebalance_nodes(&mut self, parent: Bid, index: usize) -> Result<()> {
        let sep = index.saturating_sub(1);
        let (left, right, separator) = {
            let node = self.nodes.node(parent);
            (node.child(sep), node.child(sep + 1), node.key(sep).clone())
        };
        self.nodes.get_node(left, true)?;
        if let Err(e) = self.nodes.get_node(right, true) {
            self.nodes.unfix_node(left);
            return Err(e);
        }

        let joined = {
            let (left_node, right_node) = self.nodes.pair_mut(left, right);
            let level = right_node.level();
            match join_nodes(left_node.take(), separator, right_node.take(), self.max_node) {
                Joined::One((keys, children)) => {
                    right_node.fill(level, keys, children);
                    None
                }
                Joined::Two {
                    left: (lk, lc),
                    separator,
                    right: (rk, rc),
                } => {
                    left_node.fill(level, lk, lc);
                    right_node.fill(level, rk, rc);
                    Some(separator)
                }
            }
        };
        self.nodes.unfix_node(left);
        self.nodes.unfix_node(right);

        match joined {
            None => {
                self.nodes.node_mut(parent).remove_child(sep);
                self.nodes.delete_node(left)?;
                debug!(left = %left, right = %right, "nodes fused");
            }
            Some(separator) => {
                self.nodes.node_mut(parent).set_key(sep, separator);
                debug!(left = %left, right = %right, "nodes balanced");
            }
        }
        Ok(())
    }

    /// Replaces a root left with a single child by that child.
    fn shrink_root(&mut self) -> Result<()> {
        while self.height > 2 && self.nodes.node(self.root).num_keys() == 0 {
            let child = self.nodes.node(self.root).child(0);
            self.nodes.get_node(child, true)?;
            let old = std::mem::replace(&mut self.root, child);
            self.height -= 1;
            self.nodes.unfix_node(old);
            self.nodes.delete_node(old)?;
            debug!(root = %child, height = self.height, "root collapsed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Whole-tree operations
    // -------------------------------------------------------------------

    /// Removes every entry. All cursors become End.
    pub fn clear(&mut self) -> Result<()> {
        self.iterators.borrow_mut().invalidate_all();
        self.release_blocks()?;
        self.init_root()
    }

    /// Frees every node and leaf.
    fn release_blocks(&mut self) -> Result<()> {
        if !self.root.is_valid() {
            return Ok(());
        }
        let mut level = vec![self.root];
        let mut nodes = Vec::new();
        for _ in 1..self.height {
            let mut below = Vec::new();
            for &bid in &level {
                below.extend_from_slice(self.nodes.get_node(bid, false)?.children());
            }
            nodes.append(&mut level);
            level = below;
        }

        self.nodes.unfix_node(self.root);
        self.root = Bid::INVALID;
        self.height = 0;
        self.len = 0;
        for bid in nodes {
            self.nodes.delete_node(bid)?;
        }
        for bid in level {
            self.leaves.delete_node(bid)?;
        }
        Ok(())
    }

    /// Writes every modified node and leaf to disk.
    pub fn flush(&mut self) -> Result<()> {
        let nodes = self.nodes.flush()?;
        let leaves = self.leaves.flush()?;
        debug!(nodes, leaves, "btree flushed");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Bulk construction
    // -------------------------------------------------------------------

    /// Builds a tree from entries sorted by strictly increasing key.
    ///
    /// Leaves and nodes are filled to the configured fill factors level by
    /// level, without going through insertion. Fails with `UnsortedInput`
    /// on an out-of-order or repeated key, and with `CacheTooSmall` when the
    /// node cache cannot hold a path from the root to the leaves plus one
    /// node.
    pub fn bulk_load<I>(manager: Arc<BlockManager>, config: BTreeConfig, items: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut tree = Self::open(manager, config)?;
        let leaves = tree.build_leaves(items)?;
        if leaves.is_empty() {
            tree.init_root()?;
            return Ok(tree);
        }

        let required = tree.node_levels(leaves.len()) + 1;
        let available = tree.nodes.capacity();
        if required > available {
            tree.discard_leaves(leaves.iter().map(|(_, bid)| *bid));
            tree.len = 0;
            return Err(StrataError::CacheTooSmall {
                required,
                available,
            });
        }

        let num_leaves = leaves.len();
        tree.build_nodes(leaves)?;
        info!(
            entries = tree.len,
            leaves = num_leaves,
            height = tree.height,
            "bulk construction finished"
        );
        Ok(tree)
    }

    fn build_leaves<I>(&mut self, items: I) -> Result<Vec<(K, Bid)>>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut level = Vec::new();
        let mut current = None;
        let filled = self.fill_leaves(items, &mut level, &mut current);
        if let Some(cur) = current {
            self.leaves.unfix_node(cur);
            match self.leaves.node(cur).max_key().cloned() {
                Some(max) => level.push((max, cur)),
                None => self.discard_leaves([cur]),
            }
        }

        let result = filled.and_then(|count| {
            self.len = count;
            self.balance_last_leaf(&mut level)
        });
        if let Err(e) = result {
            self.discard_leaves(level.iter().map(|(_, bid)| *bid));
            self.len = 0;
            return Err(e);
        }
        Ok(level)
    }

    /// Streams `items` into chained leaves. Completed leaves are appended to
    /// `level`; the leaf being filled stays fixed in `current`.
    fn fill_leaves<I>(
        &mut self,
        items: I,
        level: &mut Vec<(K, Bid)>,
        current: &mut Option<Bid>,
    ) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let per_leaf = fill_count(self.max_leaf, self.config.leaf_fill_factor).max(self.min_leaf);
        let mut count = 0;
        for (key, value) in items {
            match *current {
                Some(cur) => {
                    let leaf = self.leaves.node(cur);
                    if leaf.max_key().is_some_and(|max| key <= *max) {
                        return Err(StrataError::UnsortedInput { position: count });
                    }
                    if leaf.len() >= per_leaf {
                        let next = self.leaves.get_new_node()?;
                        self.leaves.node_mut(next).set_pred(cur);
                        let max = {
                            let full = self.leaves.node_mut(cur);
                            full.set_succ(next);
                            full.max_key().cloned()
                        };
                        self.leaves.unfix_node(cur);
                        if let Some(max) = max {
                            level.push((max, cur));
                        }
                        *current = Some(next);
                    }
                }
                None => *current = Some(self.leaves.get_new_node()?),
            }
            if let Some(cur) = *current {
                self.leaves.node_mut(cur).push(key, value);
            }
            count += 1;
        }
        Ok(count)
    }

    /// Evens out the last two leaves when the last one underflows.
    fn balance_last_leaf(&mut self, level: &mut Vec<(K, Bid)>) -> Result<()> {
        let n = level.len();
        if n < 2 {
            return Ok(());
        }
        let (prev, last) = (level[n - 2].1, level[n - 1].1);
        let r = self.leaves.get_node(last, false)?.len();
        if r >= self.min_leaf {
            return Ok(());
        }
        self.leaves.get_node(prev, true)?;
        if let Err(e) = self.leaves.get_node(last, true) {
            self.leaves.unfix_node(prev);
            return Err(e);
        }

        let l = self.leaves.node(prev).len();
        let fused = l + r <= self.max_leaf;
        {
            let (prev_leaf, last_leaf) = self.leaves.pair_mut(prev, last);
            if fused {
                prev_leaf.append(last_leaf.take_entries());
                prev_leaf.set_succ(Bid::INVALID);
            } else {
                let target = (l + r) / 2;
                last_leaf.prepend(prev_leaf.take_back(l - target));
            }
        }
        let prev_max = self.leaves.node(prev).max_key().cloned();
        self.leaves.unfix_node(prev);
        self.leaves.unfix_node(last);

        if fused {
            self.leaves.delete_node(last)?;
            level.pop();
        }
        if let (Some(max), Some(entry)) = (prev_max, level.get_mut(n - 2)) {
            entry.0 = max;
        }
        Ok(())
    }

    fn discard_leaves(&mut self, bids: impl IntoIterator<Item = Bid>) {
        for bid in bids {
            if let Err(e) = self.leaves.delete_node(bid) {
                warn!(leaf = %bid, error = %e, "failed to free leaf");
            }
        }
    }

    fn children_per_node(&self) -> usize {
        fill_count(self.max_node + 1, self.config.node_fill_factor)
            .clamp(self.min_node + 1, self.max_node + 1)
    }

    /// Node levels needed above `leaves` leaves.
    fn node_levels(&self, leaves: usize) -> usize {
        let per_node = self.children_per_node();
        let mut count = leaves;
        let mut levels = 0;
        loop {
            count = count.div_ceil(per_node);
            levels += 1;
            if count <= 1 {
                return levels;
            }
        }
    }

    /// Builds the node levels above `level` and installs the root.
    fn build_nodes(&mut self, mut level: Vec<(K, Bid)>) -> Result<()> {
        let per_node = self.children_per_node();
        let mut node_level = 1u32;
        loop {
            let mut parents = Vec::with_capacity(level.len().div_ceil(per_node));
            for chunk in level.chunks(per_node) {
                let bid = self.nodes.get_new_node()?;
                let (last_key, _) = &chunk[chunk.len() - 1];
                let keys = chunk[..chunk.len() - 1]
                    .iter()
                    .map(|(k, _)| k.clone())
                    .collect();
                let children = chunk.iter().map(|(_, b)| *b).collect();
                self.nodes.node_mut(bid).fill(node_level, keys, children);
                self.nodes.unfix_node(bid);
                parents.push((last_key.clone(), bid));
            }
            self.balance_last_node(&mut parents)?;
            level = parents;
            if level.len() == 1 {
                break;
            }
            node_level += 1;
        }

        let root = level[0].1;
        self.nodes.get_node(root, true)?;
        self.root = root;
        self.height = node_level as usize + 1;
        Ok(())
    }

    /// Evens out the last two nodes of a level when the last underflows.
    fn balance_last_node(&mut self, parents: &mut Vec<(K, Bid)>) -> Result<()> {
        let n = parents.len();
        if n < 2 {
            return Ok(());
        }
        let (prev, last) = (parents[n - 2].1, parents[n - 1].1);
        if self.nodes.get_node(last, false)?.num_keys() >= self.min_node {
            return Ok(());
        }
        self.nodes.get_node(prev, true)?;
        if let Err(e) = self.nodes.get_node(last, true) {
            self.nodes.unfix_node(prev);
            return Err(e);
        }

        let separator = parents[n - 2].0.clone();
        let joined = {
            let (prev_node, last_node) = self.nodes.pair_mut(prev, last);
            let level = prev_node.level();
            match join_nodes(prev_node.take(), separator, last_node.take(), self.max_node) {
                Joined::One((keys, children)) => {
                    prev_node.fill(level, keys, children);
                    None
                }
                Joined::Two {
                    left: (lk, lc),
                    separator,
                    right: (rk, rc),
                } => {
                    prev_node.fill(level, lk, lc);
                    last_node.fill(level, rk, rc);
                    Some(separator)
                }
            }
        };
        self.nodes.unfix_node(prev);
        self.nodes.unfix_node(last);

        match joined {
            None => {
                self.nodes.delete_node(last)?;
                if let Some((max, _)) = parents.pop() {
                    parents[n - 2].0 = max;
                }
            }
            Some(separator) => parents[n - 2].0 = separator,
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Consistency checking
    // -------------------------------------------------------------------

    /// Walks the whole tree and verifies ordering, fill bounds, sibling
    /// links, the entry count and every registered cursor.
    pub fn check_invariants(&mut self) -> Result<()> {
        let mut leaves = Vec::new();
        let root = self.root;
        let count = self.check_node(root, self.height - 1, None, None, true, &mut leaves)?;
        if count != self.len {
            return Err(corrupted(
                root,
                format!("tree holds {count} entries, expected {}", self.len),
            ));
        }

        for (i, &bid) in leaves.iter().enumerate() {
            let expected_pred = if i == 0 { Bid::INVALID } else { leaves[i - 1] };
            let expected_succ = leaves.get(i + 1).copied().unwrap_or(Bid::INVALID);
            let leaf = self.leaves.get_node(bid, false)?;
            if leaf.pred() != expected_pred || leaf.succ() != expected_succ {
                return Err(corrupted(bid, "broken leaf chain"));
            }
            if leaves.len() > 1 && leaf.len() < self.min_leaf {
                return Err(corrupted(bid, format!("leaf underflow: {}", leaf.len())));
            }
        }

        let positions = self.iterators.borrow().positions();
        for (leaf, pos) in positions {
            if !leaves.contains(&leaf) {
                return Err(corrupted(leaf, "cursor points at a block outside the tree"));
            }
            if pos >= self.leaves.get_node(leaf, false)?.len() {
                return Err(corrupted(leaf, format!("cursor position {pos} out of range")));
            }
        }
        Ok(())
    }

    fn check_node(
        &mut self,
        bid: Bid,
        level: usize,
        lower: Option<K>,
        upper: Option<K>,
        is_root: bool,
        leaves: &mut Vec<Bid>,
    ) -> Result<usize> {
        let (keys, children, node_level) = {
            let node = self.nodes.get_node(bid, false)?;
            (node.keys().to_vec(), node.children().to_vec(), node.level())
        };
        if node_level as usize != level {
            return Err(corrupted(bid, format!("level {node_level}, expected {level}")));
        }
        if children.len() != keys.len() + 1 {
            return Err(corrupted(bid, "child count does not match key count"));
        }
        if keys.len() > self.max_node || (!is_root && keys.len() < self.min_node) {
            return Err(corrupted(bid, format!("node holds {} keys", keys.len())));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(corrupted(bid, "node keys out of order"));
        }
        if let (Some(lo), Some(first)) = (&lower, keys.first()) {
            if first <= lo {
                return Err(corrupted(bid, "node key below its range"));
            }
        }
        if let (Some(hi), Some(last)) = (&upper, keys.last()) {
            if last > hi {
                return Err(corrupted(bid, "node key above its range"));
            }
        }

        let mut total = 0;
        for (i, &child) in children.iter().enumerate() {
            let lo = if i == 0 {
                lower.clone()
            } else {
                Some(keys[i - 1].clone())
            };
            let hi = if i == keys.len() {
                upper.clone()
            } else {
                Some(keys[i].clone())
            };
            total += if level == 1 {
                self.check_leaf(child, lo, hi, leaves)?
            } else {
                self.check_node(child, level - 1, lo, hi, false, leaves)?
            };
        }
        Ok(total)
    }

    fn check_leaf(
        &mut self,
        bid: Bid,
        lower: Option<K>,
        upper: Option<K>,
        leaves: &mut Vec<Bid>,
    ) -> Result<usize> {
        let leaf = self.leaves.get_node(bid, false)?;
        let entries = leaf.entries();
        if entries.len() > self.max_leaf {
            return Err(corrupted(bid, format!("leaf holds {} entries", entries.len())));
        }
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(corrupted(bid, "leaf keys out of order"));
        }
        if let (Some(lo), Some((first, _))) = (&lower, entries.first()) {
            if first <= lo {
                return Err(corrupted(bid, "leaf key below its range"));
            }
        }
        if let (Some(hi), Some((last, _))) = (&upper, entries.last()) {
            if last > hi {
                return Err(corrupted(bid, "leaf key above its range"));
            }
        }
        let len = entries.len();
        leaves.push(bid);
        Ok(len)
    }
}

impl<K: FixedCodec + Ord, V: FixedCodec> Drop for BTree<K, V> {
    fn drop(&mut self) {
        self.iterators.borrow_mut().invalidate_all();
        if let Err(e) = self.release_blocks() {
            warn!(error = %e, "failed to release tree blocks on drop");
        }
    }
}

/// Iterator over tree entries in key order.
///
/// Holds the tree mutably, so the tree cannot change underneath it.
pub struct Iter<'a, K: FixedCodec + Ord, V: FixedCodec> {
    tree: &'a mut BTree<K, V>,
    /// Lower bound, until the first call positions the iterator.
    start: Option<K>,
    leaf: Bid,
    pos: usize,
    done: bool,
}

impl<K: FixedCodec + Ord, V: FixedCodec> Iter<'_, K, V> {
    fn position(&mut self) -> Result<()> {
        if self.leaf.is_valid() {
            return Ok(());
        }
        match self.start.take() {
            Some(key) => {
                self.leaf = self.tree.find_leaf(&key)?;
                let (Ok(pos) | Err(pos)) = self.tree.leaves.get_node(self.leaf, false)?.search(&key);
                self.pos = pos;
            }
            None => {
                self.leaf = self.tree.edge_leaf(false)?;
                self.pos = 0;
            }
        }
        Ok(())
    }
}

impl<K: FixedCodec + Ord, V: FixedCodec> Iterator for Iter<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(e) = self.position() {
            self.done = true;
            return Some(Err(e));
        }
        loop {
            let leaf = match self.tree.leaves.get_node(self.leaf, false) {
                Ok(leaf) => leaf,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if let Some(entry) = leaf.entry(self.pos) {
                let entry = entry.clone();
                self.pos += 1;
                return Some(Ok(entry));
            }
            let succ = leaf.succ();
            if !succ.is_valid() {
                self.done = true;
                return None;
            }
            self.leaf = succ;
            self.pos = 0;
        }
    }
}
