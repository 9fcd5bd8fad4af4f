//! External-memory B+ tree for strata.
//!
//! This crate provides an ordered map stored in blocks on strata disks:
//! - Fixed-size key and value encoding
//! - Leaf and internal node block formats
//! - Insertion, erasure and range navigation through two node caches
//! - Cursors that stay valid across splits, fusions and rebalancing
//! - Bottom-up bulk construction from sorted input

mod codec;
mod cursor;
mod iterator_map;
mod leaf;
mod node;
mod tree;

pub use codec::FixedCodec;
pub use cursor::Cursor;
pub use iterator_map::{CursorPos, IteratorMap};
pub use leaf::Leaf;
pub use node::Node;
pub use tree::{BTree, BTreeStats, Iter};
