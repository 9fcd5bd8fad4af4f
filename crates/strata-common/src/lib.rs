//! Strata common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all strata components:
//! - Block identifiers (`Bid`) and disk identifiers
//! - The workspace-wide error type
//! - Configuration for disks, caches and trees

pub mod block;
pub mod config;
pub mod error;

pub use block::{Bid, DiskId, FileId, DEFAULT_BLOCK_SIZE};
pub use config::{
    BTreeConfig, CacheConfig, DiskConfig, FileKind, IoConfig, PriorityOp, ReplacementPolicy,
    StrategyKind,
};
pub use error::{Result, StrataError};
