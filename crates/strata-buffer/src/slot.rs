//! Cache slot definitions.

use std::fmt;
use strata_common::Bid;
use strata_io::Request;

/// Index of a slot in a node cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Sentinel for "no slot".
    pub const INVALID: SlotId = SlotId(u32::MAX);

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// Contents of a slot.
pub(crate) enum SlotState<N> {
    /// Unused, on the free list.
    Free,
    /// A read was issued and has not been consumed yet.
    Loading(Request),
    /// The block is decoded and usable.
    Resident(N),
}

/// One cache entry: a block, its fix count and its dirty flag.
pub(crate) struct CacheSlot<N> {
    bid: Bid,
    state: SlotState<N>,
    fix_count: u32,
    dirty: bool,
}

impl<N> CacheSlot<N> {
    pub(crate) fn empty() -> Self {
        Self {
            bid: Bid::INVALID,
            state: SlotState::Free,
            fix_count: 0,
            dirty: false,
        }
    }

    #[inline]
    pub(crate) fn bid(&self) -> Bid {
        self.bid
    }

    #[inline]
    pub(crate) fn state(&self) -> &SlotState<N> {
        &self.state
    }

    pub(crate) fn is_free(&self) -> bool {
        matches!(self.state, SlotState::Free)
    }

    pub(crate) fn is_loading(&self) -> bool {
        matches!(self.state, SlotState::Loading(_))
    }

    pub(crate) fn node(&self) -> Option<&N> {
        match &self.state {
            SlotState::Resident(node) => Some(node),
            _ => None,
        }
    }

    pub(crate) fn node_mut(&mut self) -> Option<&mut N> {
        match &mut self.state {
            SlotState::Resident(node) => Some(node),
            _ => None,
        }
    }

    /// Installs a decoded block.
    pub(crate) fn install(&mut self, bid: Bid, node: N, dirty: bool) {
        self.bid = bid;
        self.state = SlotState::Resident(node);
        self.dirty = dirty;
    }

    /// Marks the slot as waiting for `request`.
    pub(crate) fn start_loading(&mut self, bid: Bid, request: Request) {
        self.bid = bid;
        self.state = SlotState::Loading(request);
        self.dirty = false;
    }

    /// Takes the in-flight read, leaving the slot free.
    pub(crate) fn take_request(&mut self) -> Option<Request> {
        match std::mem::replace(&mut self.state, SlotState::Free) {
            SlotState::Loading(request) => Some(request),
            other => {
                self.state = other;
                None
            }
        }
    }

    #[inline]
    pub(crate) fn fix_count(&self) -> u32 {
        self.fix_count
    }

    #[inline]
    pub(crate) fn is_fixed(&self) -> bool {
        self.fix_count > 0
    }

    #[inline]
    pub(crate) fn fix(&mut self) {
        self.fix_count += 1;
    }

    /// Drops one fix. Returns the remaining count.
    ///
    /// # Panics
    ///
    /// Panics when the slot is not fixed.
    pub(crate) fn unfix(&mut self) -> u32 {
        assert!(
            self.fix_count > 0,
            "unfix of {} whose fix count is already zero",
            self.bid
        );
        self.fix_count -= 1;
        self.fix_count
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Returns the slot to the free state and hands back its node, if any.
    pub(crate) fn reset(&mut self) -> Option<N> {
        self.bid = Bid::INVALID;
        self.fix_count = 0;
        self.dirty = false;
        match std::mem::replace(&mut self.state, SlotState::Free) {
            SlotState::Resident(node) => Some(node),
            _ => None,
        }
    }
}

impl<N> fmt::Debug for CacheSlot<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            SlotState::Free => "free",
            SlotState::Loading(_) => "loading",
            SlotState::Resident(_) => "resident",
        };
        f.debug_struct("CacheSlot")
            .field("bid", &self.bid)
            .field("state", &state)
            .field("fix_count", &self.fix_count)
            .field("dirty", &self.dirty)
            .finish()
    }
}
