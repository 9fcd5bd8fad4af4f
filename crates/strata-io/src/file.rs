//! Storage file backends.
//!
//! A backend performs the blocking positional I/O that a disk queue worker
//! executes on behalf of a `Request`. `StorageFile` pairs a backend with the
//! queue of its disk and is the entry point for asynchronous reads and
//! writes.

use crate::disk_queue::DiskQueue;
use crate::request::{CompletionHandler, Request, RequestKind};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{DiskId, FileId, Result, StrataError};
use tracing::{debug, warn};

/// Blocking positional I/O on one storage file.
pub trait FileBackend: Send + Sync {
    /// Reads exactly `buf.len()` bytes at `offset`.
    fn serve_read(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()>;

    /// Writes all of `buf` at `offset`.
    fn serve_write(&self, buf: &[u8], offset: u64) -> std::io::Result<()>;

    /// Current size in bytes.
    fn size(&self) -> Result<u64>;

    /// Truncates or extends the file to `size` bytes.
    fn set_size(&self, size: u64) -> Result<()>;

    /// File identifier, the `file` half of every BID naming this file.
    fn id(&self) -> FileId;

    /// Physical disk the file lives on.
    fn disk(&self) -> DiskId;

    /// Short backend name for logging.
    fn io_type(&self) -> &'static str;
}

/// A regular file accessed with `pread`/`pwrite`.
pub struct SyscallFile {
    id: FileId,
    disk: DiskId,
    path: PathBuf,
    file: File,
    delete_on_drop: bool,
}

impl SyscallFile {
    /// Opens (creating if needed) the file at `path`.
    pub fn open(path: &Path, id: FileId, disk: DiskId, delete_on_drop: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        debug!(file = id, disk, path = %path.display(), "opened syscall file");
        Ok(Self {
            id,
            disk,
            path: path.to_path_buf(),
            file,
            delete_on_drop,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileBackend for SyscallFile {
    fn serve_read(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn serve_write(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn id(&self) -> FileId {
        self.id
    }

    fn disk(&self) -> DiskId {
        self.disk
    }

    fn io_type(&self) -> &'static str {
        "syscall"
    }
}

impl Drop for SyscallFile {
    fn drop(&mut self) {
        if self.delete_on_drop {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove storage file");
            }
        }
    }
}

/// A growable in-memory byte array standing in for a disk.
pub struct MemoryFile {
    id: FileId,
    disk: DiskId,
    data: Mutex<Vec<u8>>,
}

impl MemoryFile {
    /// Creates an empty memory file.
    pub fn new(id: FileId, disk: DiskId) -> Self {
        Self {
            id,
            disk,
            data: Mutex::new(Vec::new()),
        }
    }
}

impl FileBackend for MemoryFile {
    fn serve_read(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of {}..{} beyond end of {} bytes", start, end, data.len()),
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn serve_write(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_size(&self, size: u64) -> Result<()> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn id(&self) -> FileId {
        self.id
    }

    fn disk(&self) -> DiskId {
        self.disk
    }

    fn io_type(&self) -> &'static str {
        "memory"
    }
}

/// A backend bound to the queue of its disk.
#[derive(Clone)]
pub struct StorageFile {
    backend: Arc<dyn FileBackend>,
    queue: Arc<DiskQueue>,
}

impl StorageFile {
    /// Binds `backend` to `queue`. The queue must serve the backend's disk.
    pub fn new(backend: Arc<dyn FileBackend>, queue: Arc<DiskQueue>) -> Result<Self> {
        if backend.disk() != queue.disk() {
            return Err(StrataError::Internal(format!(
                "file {} lives on disk {} but was bound to queue of disk {}",
                backend.id(),
                backend.disk(),
                queue.disk()
            )));
        }
        Ok(Self { backend, queue })
    }

    /// Schedules a read of `buffer.len()` bytes at `offset`. The buffer is
    /// handed back through `Request::take_buffer` once the request is done.
    pub fn aread(
        &self,
        buffer: Vec<u8>,
        offset: u64,
        handler: Option<CompletionHandler>,
    ) -> Result<Request> {
        self.submit(RequestKind::Read, buffer, offset, handler)
    }

    /// Schedules a write of `buffer` at `offset`.
    pub fn awrite(
        &self,
        buffer: Vec<u8>,
        offset: u64,
        handler: Option<CompletionHandler>,
    ) -> Result<Request> {
        self.submit(RequestKind::Write, buffer, offset, handler)
    }

    fn submit(
        &self,
        kind: RequestKind,
        buffer: Vec<u8>,
        offset: u64,
        handler: Option<CompletionHandler>,
    ) -> Result<Request> {
        let request = Request::new(Arc::clone(&self.backend), kind, buffer, offset, handler);
        self.queue.add_request(request.clone())?;
        Ok(request)
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    /// The queue serving this file.
    pub fn queue(&self) -> &Arc<DiskQueue> {
        &self.queue
    }

    pub fn id(&self) -> FileId {
        self.backend.id()
    }

    pub fn disk(&self) -> DiskId {
        self.backend.disk()
    }

    pub fn size(&self) -> Result<u64> {
        self.backend.size()
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        self.backend.set_size(size)
    }
}
