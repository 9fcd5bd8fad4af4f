//! Block manager: disks, allocation and block-level I/O.
//!
//! The block manager is an explicitly constructed service. It owns one
//! storage file, one free-space allocator and one disk queue per configured
//! disk, and is shared by reference (usually `Arc`) among the containers
//! that allocate blocks from it. File and disk identifiers coincide: disk
//! `d` holds file `d`.

use crate::allocator::DiskAllocator;
use crate::disk_queue::{DiskQueueStats, DiskQueues};
use crate::file::{FileBackend, MemoryFile, StorageFile, SyscallFile};
use crate::request::{CompletionHandler, Request};
use crate::strategy::AllocationStrategy;
use crate::wait::wait_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::{Bid, DiskConfig, DiskId, FileKind, IoConfig, PriorityOp, Result, StrataError};
use tracing::{debug, info, warn};

struct Disk {
    file: StorageFile,
    allocator: Mutex<DiskAllocator>,
}

/// Counters of a block manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockManagerStats {
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub reads_served: u64,
    pub writes_served: u64,
}

/// Allocates, frees, reads and writes blocks across the configured disks.
pub struct BlockManager {
    disks: Vec<Disk>,
    queues: DiskQueues,
    blocks_allocated: AtomicU64,
    blocks_freed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl BlockManager {
    /// Opens every disk of `config` and starts its queue.
    pub fn new(config: &IoConfig) -> Result<Self> {
        if config.disks.is_empty() {
            return Err(StrataError::NoDisks);
        }

        let queues = DiskQueues::new(config.queue_priority);
        let mut disks = Vec::with_capacity(config.disks.len());
        for (i, disk_config) in config.disks.iter().enumerate() {
            let disk = i as DiskId;
            let backend = open_backend(disk_config, disk)?;
            if backend.size()? < disk_config.capacity {
                backend.set_size(disk_config.capacity)?;
            }
            let file = StorageFile::new(backend, queues.get_or_create(disk)?)?;
            info!(
                disk,
                io = file.backend().io_type(),
                path = %disk_config.path.display(),
                capacity = disk_config.capacity,
                autogrow = disk_config.autogrow,
                "disk opened"
            );
            disks.push(Disk {
                file,
                allocator: Mutex::new(DiskAllocator::new(
                    disk,
                    disk,
                    disk_config.capacity,
                    disk_config.autogrow,
                )),
            });
        }

        Ok(Self {
            disks,
            queues,
            blocks_allocated: AtomicU64::new(0),
            blocks_freed: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// A manager over `count` growable in-memory disks.
    pub fn in_memory(count: usize) -> Result<Self> {
        Self::new(&IoConfig::memory(count))
    }

    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }

    fn disk(&self, disk: DiskId) -> Result<&Disk> {
        self.disks
            .get(disk as usize)
            .ok_or(StrataError::FileNotOpen(disk))
    }

    /// Disk holding `bid`.
    pub fn disk_of(&self, bid: Bid) -> Result<DiskId> {
        if !bid.is_valid() {
            return Err(StrataError::BlockNotAllocated(bid));
        }
        self.disk(bid.file)?;
        Ok(bid.file)
    }

    /// Allocates `count` blocks of `block_size` bytes. Block `i` goes to the
    /// disk `strategy` chooses for index `offset + i`. On failure nothing
    /// stays allocated.
    pub fn new_blocks(
        &self,
        strategy: &mut dyn AllocationStrategy,
        block_size: usize,
        count: usize,
        offset: usize,
    ) -> Result<Vec<Bid>> {
        let mut bids = Vec::with_capacity(count);
        for i in 0..count {
            match self.new_block(strategy, block_size, offset + i) {
                Ok(bid) => bids.push(bid),
                Err(e) => {
                    if let Err(undo) = self.delete_blocks(&bids, block_size) {
                        warn!(error = %undo, "failed to release partial allocation");
                    }
                    return Err(e);
                }
            }
        }
        Ok(bids)
    }

    /// Allocates one block on the disk `strategy` chooses for `index`.
    pub fn new_block(
        &self,
        strategy: &mut dyn AllocationStrategy,
        block_size: usize,
        index: usize,
    ) -> Result<Bid> {
        let disk_id = strategy.disk(index);
        let disk = self.disk(disk_id)?;

        let offset = {
            let mut allocator = disk.allocator.lock();
            let offset = allocator.allocate(block_size as u64)?;
            let capacity = allocator.capacity();
            if disk.file.size()? < capacity {
                disk.file.set_size(capacity)?;
            }
            offset
        };

        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
        let bid = Bid::new(disk.file.id(), offset);
        debug!(bid = %bid, size = block_size, strategy = strategy.name(), "block allocated");
        Ok(bid)
    }

    /// Frees blocks of `block_size` bytes. Stops at the first block that was
    /// not allocated.
    pub fn delete_blocks(&self, bids: &[Bid], block_size: usize) -> Result<()> {
        for &bid in bids {
            self.delete_block(bid, block_size)?;
        }
        Ok(())
    }

    pub fn delete_block(&self, bid: Bid, block_size: usize) -> Result<()> {
        let disk = self.disk(self.disk_of(bid)?)?;
        disk.allocator.lock().free(bid.offset, block_size as u64)?;
        self.blocks_freed.fetch_add(1, Ordering::Relaxed);
        debug!(bid = %bid, "block freed");
        Ok(())
    }

    /// Schedules a read of `buffer.len()` bytes of `bid`.
    pub fn aread_block(
        &self,
        bid: Bid,
        buffer: Vec<u8>,
        handler: Option<CompletionHandler>,
    ) -> Result<Request> {
        let disk = self.disk(self.disk_of(bid)?)?;
        self.bytes_read
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        disk.file.aread(buffer, bid.offset, handler)
    }

    /// Schedules a write of `buffer` to `bid`.
    pub fn awrite_block(
        &self,
        bid: Bid,
        buffer: Vec<u8>,
        handler: Option<CompletionHandler>,
    ) -> Result<Request> {
        let disk = self.disk(self.disk_of(bid)?)?;
        self.bytes_written
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);
        disk.file.awrite(buffer, bid.offset, handler)
    }

    /// Reads `block_size` bytes of `bid` and waits for them.
    pub fn read_block(&self, bid: Bid, block_size: usize) -> Result<Vec<u8>> {
        self.aread_block(bid, vec![0u8; block_size], None)?
            .wait_buffer()
    }

    /// Writes `data` to `bid` and waits for completion.
    pub fn write_block(&self, bid: Bid, data: Vec<u8>) -> Result<()> {
        self.awrite_block(bid, data, None)?.wait()
    }

    /// Writes many blocks concurrently and waits for all of them.
    pub fn write_blocks(&self, blocks: Vec<(Bid, Vec<u8>)>) -> Result<()> {
        let requests = blocks
            .into_iter()
            .map(|(bid, data)| self.awrite_block(bid, data, None))
            .collect::<Result<Vec<_>>>()?;
        wait_all(&requests)
    }

    /// Changes the service policy of every disk queue.
    pub fn set_priority_op(&self, priority: PriorityOp) {
        self.queues.set_priority_op(priority);
    }

    /// Total managed bytes over all disks.
    pub fn total_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.allocator.lock().capacity()).sum()
    }

    /// Free managed bytes over all disks.
    pub fn free_bytes(&self) -> u64 {
        self.disks
            .iter()
            .map(|d| d.allocator.lock().free_bytes())
            .sum()
    }

    pub fn queue_stats(&self, disk: DiskId) -> Option<DiskQueueStats> {
        self.queues.stats(disk)
    }

    pub fn stats(&self) -> BlockManagerStats {
        let mut stats = BlockManagerStats {
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            ..Default::default()
        };
        for disk in 0..self.disks.len() {
            if let Some(q) = self.queues.stats(disk as DiskId) {
                stats.reads_served += q.reads_served;
                stats.writes_served += q.writes_served;
            }
        }
        stats
    }
}

fn open_backend(config: &DiskConfig, disk: DiskId) -> Result<Arc<dyn FileBackend>> {
    Ok(match config.kind {
        FileKind::Syscall => Arc::new(SyscallFile::open(
            &config.path,
            disk,
            disk,
            config.delete_on_drop,
        )?),
        FileKind::Memory => Arc::new(MemoryFile::new(disk, disk)),
    })
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        let stats = self.stats();
        let leaked = stats.blocks_allocated.saturating_sub(stats.blocks_freed);
        if leaked > 0 {
            debug!(blocks = leaked, "block manager dropped with live blocks");
        }
        // Storage files hold the queues; release them before draining.
        self.disks.clear();
        self.queues.shutdown();
        info!(
            reads = stats.reads_served,
            writes = stats.writes_served,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "block manager shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{SingleDisk, Striping};
    use tempfile::tempdir;

    #[test]
    fn test_block_manager_requires_disks() {
        let config = IoConfig {
            disks: Vec::new(),
            queue_priority: PriorityOp::Write,
        };
        assert!(matches!(BlockManager::new(&config), Err(StrataError::NoDisks)));
    }

    #[test]
    fn test_new_blocks_striped() {
        let bm = BlockManager::in_memory(3).unwrap();
        let mut strategy = Striping::new(3);
        let bids = bm.new_blocks(&mut strategy, 4096, 6, 0).unwrap();

        let disks: Vec<DiskId> = bids.iter().map(|&b| bm.disk_of(b).unwrap()).collect();
        assert_eq!(disks, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(bids[0].offset, 0);
        assert_eq!(bids[3].offset, 4096);
        assert_eq!(bm.stats().blocks_allocated, 6);
    }

    #[test]
    fn test_new_blocks_offset_shifts_strategy() {
        let bm = BlockManager::in_memory(2).unwrap();
        let mut strategy = Striping::new(2);
        let bids = bm.new_blocks(&mut strategy, 512, 2, 1).unwrap();
        assert_eq!(bids[0].file, 1);
        assert_eq!(bids[1].file, 0);
    }

    #[test]
    fn test_write_read_block() {
        let bm = BlockManager::in_memory(2).unwrap();
        let mut strategy = Striping::new(2);
        let bid = bm.new_block(&mut strategy, 1024, 1).unwrap();

        let mut data = vec![0u8; 1024];
        data[0] = 0xAB;
        data[1023] = 0xEF;
        bm.write_block(bid, data.clone()).unwrap();
        assert_eq!(bm.read_block(bid, 1024).unwrap(), data);

        let stats = bm.stats();
        assert_eq!(stats.bytes_written, 1024);
        assert_eq!(stats.bytes_read, 1024);
        assert_eq!(stats.writes_served, 1);
        assert_eq!(stats.reads_served, 1);
    }

    #[test]
    fn test_delete_blocks_and_reuse() {
        let bm = BlockManager::in_memory(1).unwrap();
        let mut strategy = SingleDisk::new(0);
        let bids = bm.new_blocks(&mut strategy, 2048, 3, 0).unwrap();
        assert_eq!(bm.total_bytes(), 3 * 2048);

        bm.delete_blocks(&bids[..2], 2048).unwrap();
        assert_eq!(bm.free_bytes(), 2 * 2048);
        assert_eq!(bm.stats().blocks_freed, 2);

        let again = bm.new_block(&mut strategy, 2048, 0).unwrap();
        assert_eq!(again, bids[0]);

        assert!(matches!(
            bm.delete_block(bids[1], 2048),
            Err(StrataError::BlockNotAllocated(_))
        ));
    }

    #[test]
    fn test_out_of_space_rolls_back() {
        let mut config = IoConfig::memory(1);
        config.disks[0].capacity = 4096;
        config.disks[0].autogrow = false;
        let bm = BlockManager::new(&config).unwrap();

        let mut strategy = SingleDisk::new(0);
        let err = bm.new_blocks(&mut strategy, 1024, 5, 0).unwrap_err();
        assert!(matches!(err, StrataError::OutOfSpace { disk: 0, .. }));
        assert_eq!(bm.free_bytes(), 4096);
    }

    #[test]
    fn test_unknown_disk_rejected() {
        let bm = BlockManager::in_memory(1).unwrap();
        assert!(bm.disk_of(Bid::new(5, 0)).is_err());
        assert!(bm.disk_of(Bid::INVALID).is_err());

        let mut strategy = SingleDisk::new(3);
        assert!(matches!(
            bm.new_block(&mut strategy, 512, 0),
            Err(StrataError::FileNotOpen(3))
        ));
    }

    #[test]
    fn test_syscall_disks_on_tempdir() {
        let dir = tempdir().unwrap();
        let text = format!(
            "disk={},0,syscall,delete\ndisk={},1MiB,syscall\n",
            dir.path().join("d0").display(),
            dir.path().join("d1").display()
        );
        let config = IoConfig::parse(&text).unwrap();
        {
            let bm = BlockManager::new(&config).unwrap();
            let mut strategy = Striping::new(2);
            let bids = bm.new_blocks(&mut strategy, 4096, 4, 0).unwrap();
            let blocks = bids
                .iter()
                .enumerate()
                .map(|(i, &bid)| (bid, vec![i as u8; 4096]))
                .collect();
            bm.write_blocks(blocks).unwrap();
            for (i, &bid) in bids.iter().enumerate() {
                assert_eq!(bm.read_block(bid, 4096).unwrap(), vec![i as u8; 4096]);
            }
            assert!(dir.path().join("d0").exists());
        }
        assert!(!dir.path().join("d0").exists());
        assert!(dir.path().join("d1").exists());
    }

    #[test]
    fn test_async_block_io_with_handler() {
        use std::sync::atomic::AtomicUsize;

        let bm = BlockManager::in_memory(2).unwrap();
        let mut strategy = Striping::new(2);
        let bids = bm.new_blocks(&mut strategy, 256, 8, 0).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        let requests: Vec<Request> = bids
            .iter()
            .map(|&bid| {
                let completed = Arc::clone(&completed);
                let handler: CompletionHandler = Box::new(move |_| {
                    completed.fetch_add(1, Ordering::SeqCst);
                });
                bm.awrite_block(bid, vec![1u8; 256], Some(handler)).unwrap()
            })
            .collect();
        wait_all(&requests).unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_set_priority_op() {
        let bm = BlockManager::in_memory(2).unwrap();
        bm.set_priority_op(PriorityOp::Read);
        let bid = bm.new_block(&mut Striping::new(2), 64, 0).unwrap();
        bm.write_block(bid, vec![0u8; 64]).unwrap();
        assert_eq!(bm.queue_stats(0).unwrap().writes_served, 1);
    }
}
