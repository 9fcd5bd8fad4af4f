//! Strata asynchronous block I/O.
//!
//! This crate provides the I/O substrate for strata:
//! - Storage file backends (syscall and in-memory)
//! - Asynchronous requests with completion handlers and batch waiting
//! - One queue and worker thread per physical disk
//! - Free-space allocation and disk allocation strategies
//! - The block manager service
//! - Prefetch scheduling and a pull-based block prefetcher

pub mod allocator;
pub mod block_manager;
pub mod disk_queue;
pub mod file;
pub mod prefetcher;
pub mod request;
pub mod schedule;
pub mod strategy;
pub mod switch;
pub mod wait;

pub use allocator::DiskAllocator;
pub use block_manager::{BlockManager, BlockManagerStats};
pub use disk_queue::{DiskQueue, DiskQueueStats, DiskQueues};
pub use file::{FileBackend, MemoryFile, StorageFile, SyscallFile};
pub use prefetcher::BlockPrefetcher;
pub use request::{CompletionHandler, Request, RequestKind, RequestState};
pub use schedule::{
    compute_prefetch_schedule, compute_prefetch_schedule_for_bids, simulate_async_write,
    WriteSimulation,
};
pub use strategy::{
    make_strategy, make_strategy_seeded, AllocationStrategy, FullyRandom, RandomCyclic,
    SimpleRandom, SingleDisk, Striping,
};
pub use switch::OnOffSwitch;
pub use wait::{poll_any, wait_all, wait_any};
