//! Registry of live cursors, keyed by the leaf position they point at.
//!
//! Structural changes to a leaf renumber its entries. Before mutating, the
//! tree looks up every cursor in the affected position range and moves it
//! to the entry's new leaf and position, so cursors keep denoting the same
//! element across splits, fusions and rebalancing.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use strata_common::Bid;

/// Where a cursor points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorPos {
    /// Entry `pos` of leaf `leaf`.
    At { leaf: Bid, pos: usize },
    /// Past the last entry, or invalidated.
    End,
}

impl CursorPos {
    fn key(self) -> Option<(Bid, usize)> {
        match self {
            CursorPos::At { leaf, pos } => Some((leaf, pos)),
            CursorPos::End => None,
        }
    }
}

pub(crate) type CursorCell = Rc<RefCell<CursorPos>>;

/// Cursors by (leaf, position). Holds weak handles; cursors unregister
/// themselves when dropped.
#[derive(Default)]
pub struct IteratorMap {
    entries: BTreeMap<(Bid, usize), Vec<Weak<RefCell<CursorPos>>>>,
    len: usize,
}

impl IteratorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered cursors.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Registers `cursor` under its current position. End cursors are not
    /// tracked.
    pub(crate) fn register(&mut self, cursor: &CursorCell) {
        if let Some(key) = cursor.borrow().key() {
            self.entries
                .entry(key)
                .or_default()
                .push(Rc::downgrade(cursor));
            self.len += 1;
        }
    }

    /// Removes `cursor` from the entry of its current position.
    ///
    /// # Panics
    ///
    /// Panics if a positioned cursor is not registered there.
    pub(crate) fn unregister(&mut self, cursor: &CursorCell) {
        let Some(key) = cursor.borrow().key() else {
            return;
        };
        let target = Rc::downgrade(cursor);
        let found = match self.entries.get_mut(&key) {
            Some(list) => match list.iter().position(|w| w.ptr_eq(&target)) {
                Some(i) => {
                    list.swap_remove(i);
                    if list.is_empty() {
                        self.entries.remove(&key);
                    }
                    true
                }
                None => false,
            },
            None => false,
        };
        assert!(
            found,
            "cursor at {} position {} is not registered",
            key.0, key.1
        );
        self.len -= 1;
    }

    /// Cursors pointing into `leaf` at positions `first..=last`.
    pub(crate) fn find(&self, leaf: Bid, first: usize, last: usize) -> Vec<CursorCell> {
        if first > last {
            return Vec::new();
        }
        self.entries
            .range((leaf, first)..=(leaf, last))
            .flat_map(|(_, list)| list.iter().filter_map(Weak::upgrade))
            .collect()
    }

    /// Moves every cursor in `leaf` at `first..=last` to `relocate(pos)`.
    pub(crate) fn rewrite<F>(&mut self, leaf: Bid, first: usize, last: usize, mut relocate: F)
    where
        F: FnMut(usize) -> CursorPos,
    {
        for cursor in self.find(leaf, first, last) {
            let old = *cursor.borrow();
            let CursorPos::At { pos, .. } = old else {
                continue;
            };
            self.unregister(&cursor);
            *cursor.borrow_mut() = relocate(pos);
            self.register(&cursor);
        }
    }

    /// Positions of all registered cursors, for consistency checks.
    pub fn positions(&self) -> Vec<(Bid, usize)> {
        self.entries
            .iter()
            .flat_map(|(&key, list)| std::iter::repeat(key).take(list.len()))
            .collect()
    }

    /// Points every registered cursor at End and forgets them all.
    pub fn invalidate_all(&mut self) {
        for list in self.entries.values() {
            for cursor in list.iter().filter_map(Weak::upgrade) {
                *cursor.borrow_mut() = CursorPos::End;
            }
        }
        self.entries.clear();
        self.len = 0;
    }
}

impl std::fmt::Debug for IteratorMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IteratorMap")
            .field("len", &self.len)
            .field("positions", &self.entries.len())
            .finish()
    }
}
