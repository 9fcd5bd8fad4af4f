//! Stable cursors into a tree.

use crate::iterator_map::{CursorCell, CursorPos, IteratorMap};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A position in a [`BTree`](crate::BTree) that survives structural changes.
///
/// A cursor keeps denoting the same entry while the tree splits, fuses or
/// rebalances leaves. It becomes End when its entry is erased, the tree is
/// cleared or the tree is dropped. Cursors are registered with their tree
/// for as long as they point at an entry.
pub struct Cursor {
    cell: CursorCell,
    map: Rc<RefCell<IteratorMap>>,
}

impl Cursor {
    pub(crate) fn new(pos: CursorPos, map: &Rc<RefCell<IteratorMap>>) -> Self {
        let cell = Rc::new(RefCell::new(pos));
        map.borrow_mut().register(&cell);
        Self {
            cell,
            map: Rc::clone(map),
        }
    }

    /// Current position.
    pub fn position(&self) -> CursorPos {
        *self.cell.borrow()
    }

    pub fn is_end(&self) -> bool {
        self.position() == CursorPos::End
    }

    pub(crate) fn belongs_to(&self, map: &Rc<RefCell<IteratorMap>>) -> bool {
        Rc::ptr_eq(&self.map, map)
    }

    /// Moves the cursor, keeping its registration in step.
    pub(crate) fn set_position(&mut self, pos: CursorPos) {
        let mut map = self.map.borrow_mut();
        map.unregister(&self.cell);
        *self.cell.borrow_mut() = pos;
        map.register(&self.cell);
    }
}

impl Clone for Cursor {
    fn clone(&self) -> Self {
        Cursor::new(self.position(), &self.map)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.map.borrow_mut().unregister(&self.cell);
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.map, &other.map) && self.position() == other.position()
    }
}

impl Eq for Cursor {}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position() {
            CursorPos::At { leaf, pos } => write!(f, "Cursor({leaf}, {pos})"),
            CursorPos::End => write!(f, "Cursor(end)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::Bid;

    #[test]
    fn test_cursor_lifecycle_registers() {
        let map = Rc::new(RefCell::new(IteratorMap::new()));
        let leaf = Bid::new(0, 0);
        let a = Cursor::new(CursorPos::At { leaf, pos: 1 }, &map);
        assert_eq!(map.borrow().len(), 1);

        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(map.borrow().len(), 2);

        drop(a);
        assert_eq!(map.borrow().len(), 1);
        drop(b);
        assert!(map.borrow().is_empty());
    }

    #[test]
    fn test_end_cursor_not_registered() {
        let map = Rc::new(RefCell::new(IteratorMap::new()));
        let end = Cursor::new(CursorPos::End, &map);
        assert!(end.is_end());
        assert!(map.borrow().is_empty());
    }

    #[test]
    fn test_set_position_moves_registration() {
        let map = Rc::new(RefCell::new(IteratorMap::new()));
        let leaf = Bid::new(0, 0);
        let mut c = Cursor::new(CursorPos::At { leaf, pos: 0 }, &map);
        c.set_position(CursorPos::At { leaf, pos: 5 });
        assert_eq!(map.borrow().positions(), vec![(leaf, 5)]);
        c.set_position(CursorPos::End);
        assert!(map.borrow().is_empty());
    }

    #[test]
    fn test_invalidated_cursor_drops_cleanly() {
        let map = Rc::new(RefCell::new(IteratorMap::new()));
        let c = Cursor::new(
            CursorPos::At {
                leaf: Bid::new(0, 0),
                pos: 2,
            },
            &map,
        );
        map.borrow_mut().invalidate_all();
        assert!(c.is_end());
        drop(c);
    }

    #[test]
    fn test_cursors_of_different_maps_differ() {
        let m1 = Rc::new(RefCell::new(IteratorMap::new()));
        let m2 = Rc::new(RefCell::new(IteratorMap::new()));
        let a = Cursor::new(CursorPos::End, &m1);
        let b = Cursor::new(CursorPos::End, &m2);
        assert_ne!(a, b);
        assert!(a.belongs_to(&m1));
        assert!(!b.belongs_to(&m1));
    }
}
