//! Free-space management within one storage file.

use std::collections::BTreeMap;
use strata_common::{Bid, DiskId, FileId, Result, StrataError};
use tracing::debug;

/// First-fit extent allocator over the byte range of one file.
///
/// Free extents are kept in a map from offset to length and coalesced on
/// release. With `autogrow` set, an allocation that fits nowhere extends the
/// managed capacity; the caller resizes the file to `capacity()`.
#[derive(Debug)]
pub struct DiskAllocator {
    file: FileId,
    disk: DiskId,
    free: BTreeMap<u64, u64>,
    capacity: u64,
    free_bytes: u64,
    autogrow: bool,
}

impl DiskAllocator {
    /// Creates an allocator managing `capacity` free bytes.
    pub fn new(file: FileId, disk: DiskId, capacity: u64, autogrow: bool) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            file,
            disk,
            free,
            capacity,
            free_bytes: capacity,
            autogrow,
        }
    }

    /// Reserves `size` bytes and returns their offset.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(StrataError::invalid_parameter("block size", 0));
        }

        let fit = self
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&offset, &len)| (offset, len));

        if let Some((offset, len)) = fit {
            self.free.remove(&offset);
            if len > size {
                self.free.insert(offset + size, len - size);
            }
            self.free_bytes -= size;
            return Ok(offset);
        }

        if !self.autogrow {
            return Err(StrataError::OutOfSpace {
                disk: self.disk,
                requested: size,
            });
        }

        // Reuse a free tail extent and grow past it.
        let offset = match self.free.iter().next_back() {
            Some((&offset, &len)) if offset + len == self.capacity => {
                self.free.remove(&offset);
                self.free_bytes -= len;
                offset
            }
            _ => self.capacity,
        };
        let new_capacity = offset + size;
        debug!(
            disk = self.disk,
            from = self.capacity,
            to = new_capacity,
            "growing storage file"
        );
        self.capacity = new_capacity;
        Ok(offset)
    }

    /// Returns `size` bytes at `offset` to the free map.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        let end = offset + size;
        let file = self.file;
        let not_allocated = || StrataError::BlockNotAllocated(Bid::new(file, offset));

        if size == 0 || end > self.capacity {
            return Err(not_allocated());
        }

        let mut start = offset;
        let mut len = size;

        if let Some((&prev_off, &prev_len)) = self.free.range(..=offset).next_back() {
            let prev_end = prev_off + prev_len;
            if prev_end > offset {
                return Err(not_allocated());
            }
            if prev_end == offset {
                self.free.remove(&prev_off);
                start = prev_off;
                len += prev_len;
            }
        }

        if let Some((&next_off, &next_len)) = self.free.range(offset..).next() {
            if next_off < end {
                // Undo a merge with the predecessor before failing.
                if start != offset {
                    self.free.insert(start, offset - start);
                }
                return Err(not_allocated());
            }
            if next_off == end {
                self.free.remove(&next_off);
                len += next_len;
            }
        }

        self.free.insert(start, len);
        self.free_bytes += size;
        Ok(())
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn disk(&self) -> DiskId {
        self.disk
    }

    /// Managed size in bytes; the file must be at least this large.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes
    }

    /// Number of free extents.
    pub fn fragments(&self) -> usize {
        self.free.len()
    }

    pub fn autogrow(&self) -> bool {
        self.autogrow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_first_fit() {
        let mut alloc = DiskAllocator::new(0, 0, 4096, false);
        assert_eq!(alloc.allocate(1024).unwrap(), 0);
        assert_eq!(alloc.allocate(1024).unwrap(), 1024);
        assert_eq!(alloc.free_bytes(), 2048);
        assert_eq!(alloc.used_bytes(), 2048);
    }

    #[test]
    fn test_allocate_out_of_space() {
        let mut alloc = DiskAllocator::new(0, 4, 2048, false);
        alloc.allocate(2048).unwrap();
        let err = alloc.allocate(1024).unwrap_err();
        assert!(matches!(
            err,
            StrataError::OutOfSpace {
                disk: 4,
                requested: 1024
            }
        ));
    }

    #[test]
    fn test_allocate_zero_rejected() {
        let mut alloc = DiskAllocator::new(0, 0, 4096, true);
        assert!(alloc.allocate(0).is_err());
    }

    #[test]
    fn test_autogrow_from_empty() {
        let mut alloc = DiskAllocator::new(0, 0, 0, true);
        assert_eq!(alloc.allocate(512).unwrap(), 0);
        assert_eq!(alloc.allocate(512).unwrap(), 512);
        assert_eq!(alloc.capacity(), 1024);
        assert_eq!(alloc.free_bytes(), 0);
    }

    #[test]
    fn test_autogrow_reuses_free_tail() {
        let mut alloc = DiskAllocator::new(0, 0, 1536, true);
        assert_eq!(alloc.allocate(1024).unwrap(), 0);
        // 512 free at the tail, too small for 1024: grow from 1024.
        assert_eq!(alloc.allocate(1024).unwrap(), 1024);
        assert_eq!(alloc.capacity(), 2048);
        assert_eq!(alloc.free_bytes(), 0);
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let mut alloc = DiskAllocator::new(0, 0, 4096, false);
        let a = alloc.allocate(1024).unwrap();
        let b = alloc.allocate(1024).unwrap();
        let c = alloc.allocate(1024).unwrap();
        assert_eq!(alloc.fragments(), 1);

        alloc.free(a, 1024).unwrap();
        alloc.free(c, 1024).unwrap();
        assert_eq!(alloc.fragments(), 2);

        alloc.free(b, 1024).unwrap();
        assert_eq!(alloc.fragments(), 1);
        assert_eq!(alloc.free_bytes(), 4096);
        assert_eq!(alloc.allocate(4096).unwrap(), 0);
    }

    #[test]
    fn test_free_reuses_hole() {
        let mut alloc = DiskAllocator::new(0, 0, 4096, false);
        let a = alloc.allocate(1024).unwrap();
        alloc.allocate(1024).unwrap();
        alloc.free(a, 1024).unwrap();
        assert_eq!(alloc.allocate(512).unwrap(), 0);
        assert_eq!(alloc.allocate(512).unwrap(), 512);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut alloc = DiskAllocator::new(7, 0, 4096, false);
        let a = alloc.allocate(1024).unwrap();
        alloc.free(a, 1024).unwrap();
        let err = alloc.free(a, 1024).unwrap_err();
        assert!(matches!(err, StrataError::BlockNotAllocated(bid) if bid == Bid::new(7, 0)));
        assert_eq!(alloc.free_bytes(), 4096);
    }

    #[test]
    fn test_overlapping_free_rejected_without_side_effects() {
        let mut alloc = DiskAllocator::new(0, 0, 4096, false);
        alloc.allocate(1024).unwrap();
        alloc.allocate(1024).unwrap();
        // [0, 1024) allocated, [1024, 2048) allocated, [2048, 4096) free.
        alloc.free(0, 1024).unwrap();
        assert!(alloc.free(1024, 2048).is_err());
        assert_eq!(alloc.fragments(), 2);
        assert_eq!(alloc.free_bytes(), 3072);
    }

    #[test]
    fn test_free_beyond_capacity_rejected() {
        let mut alloc = DiskAllocator::new(0, 0, 1024, false);
        assert!(alloc.free(1024, 1024).is_err());
    }
}
