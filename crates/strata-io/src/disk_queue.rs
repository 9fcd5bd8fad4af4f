//! Per-disk request queues.
//!
//! Every physical disk owns one `DiskQueue`: a read FIFO, a write FIFO and a
//! single worker thread that serves one request at a time. Different disks
//! run fully in parallel. `DiskQueues` is the registry keyed by disk id,
//! constructed explicitly and owned by the block manager.

use crate::request::{Request, RequestKind};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use strata_common::{DiskId, PriorityOp, Result, StrataError};
use tracing::{debug, info};

/// Pending requests and the service policy of one disk.
struct Pending {
    reads: VecDeque<Request>,
    writes: VecDeque<Request>,
    priority: PriorityOp,
    /// Direction served last, for alternating service.
    last_read: bool,
    shutdown: bool,
}

impl Pending {
    fn new(priority: PriorityOp) -> Self {
        Self {
            reads: VecDeque::new(),
            writes: VecDeque::new(),
            priority,
            last_read: false,
            shutdown: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Dequeues the next request according to the priority policy.
    fn pop_next(&mut self) -> Option<Request> {
        let take_read = match (self.reads.is_empty(), self.writes.is_empty()) {
            (true, true) => return None,
            (false, true) => true,
            (true, false) => false,
            (false, false) => match self.priority {
                PriorityOp::Read => true,
                PriorityOp::Write => false,
                PriorityOp::None => !self.last_read,
            },
        };
        self.last_read = take_read;
        if take_read {
            self.reads.pop_front()
        } else {
            self.writes.pop_front()
        }
    }
}

struct Shared {
    disk: DiskId,
    pending: Mutex<Pending>,
    /// Signalled on every enqueue and at shutdown.
    work: Condvar,
    reads_served: AtomicU64,
    writes_served: AtomicU64,
}

/// Counters of one disk queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskQueueStats {
    pub reads_served: u64,
    pub writes_served: u64,
    pub reads_pending: usize,
    pub writes_pending: usize,
}

/// Serializes the requests of one disk onto a dedicated worker thread.
pub struct DiskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DiskQueue {
    /// Creates the queue and starts its worker.
    pub fn new(disk: DiskId, priority: PriorityOp) -> Result<Self> {
        let shared = Arc::new(Shared {
            disk,
            pending: Mutex::new(Pending::new(priority)),
            work: Condvar::new(),
            reads_served: AtomicU64::new(0),
            writes_served: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("strata-disk-{disk}"))
                .spawn(move || worker_loop(&shared))?
        };

        debug!(disk, ?priority, "disk queue started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn disk(&self) -> DiskId {
        self.shared.disk
    }

    /// Enqueues a request into the read or write FIFO and wakes the worker.
    pub fn add_request(&self, request: Request) -> Result<()> {
        if request.disk() != self.shared.disk {
            return Err(StrataError::Internal(format!(
                "request for disk {} submitted to queue of disk {}",
                request.disk(),
                self.shared.disk
            )));
        }
        let mut pending = self.shared.pending.lock();
        if pending.shutdown {
            return Err(StrataError::Internal(format!(
                "disk queue {} is shut down",
                self.shared.disk
            )));
        }
        match request.kind() {
            RequestKind::Read => pending.reads.push_back(request),
            RequestKind::Write => pending.writes.push_back(request),
        }
        self.shared.work.notify_one();
        Ok(())
    }

    pub fn add_readreq(&self, request: Request) -> Result<()> {
        debug_assert_eq!(request.kind(), RequestKind::Read);
        self.add_request(request)
    }

    pub fn add_writereq(&self, request: Request) -> Result<()> {
        debug_assert_eq!(request.kind(), RequestKind::Write);
        self.add_request(request)
    }

    /// Changes the service policy; takes effect at the next dequeue.
    pub fn set_priority_op(&self, priority: PriorityOp) {
        self.shared.pending.lock().priority = priority;
    }

    pub fn priority_op(&self) -> PriorityOp {
        self.shared.pending.lock().priority
    }

    pub fn stats(&self) -> DiskQueueStats {
        let pending = self.shared.pending.lock();
        DiskQueueStats {
            reads_served: self.shared.reads_served.load(Ordering::Relaxed),
            writes_served: self.shared.writes_served.load(Ordering::Relaxed),
            reads_pending: pending.reads.len(),
            writes_pending: pending.writes.len(),
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let request = {
            let mut pending = shared.pending.lock();
            while pending.is_empty() && !pending.shutdown {
                shared.work.wait(&mut pending);
            }
            match pending.pop_next() {
                Some(request) => request,
                // Shut down and drained.
                None => break,
            }
        };

        // Counted before serving so a waiter woken by completion sees it.
        match request.kind() {
            RequestKind::Read => shared.reads_served.fetch_add(1, Ordering::Relaxed),
            RequestKind::Write => shared.writes_served.fetch_add(1, Ordering::Relaxed),
        };
        request.serve();
    }
}

impl Drop for DiskQueue {
    /// Drains the remaining requests, then joins the worker.
    fn drop(&mut self) {
        {
            let mut pending = self.shared.pending.lock();
            pending.shutdown = true;
            self.shared.work.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(disk = self.shared.disk, "disk queue worker panicked");
            }
        }
        debug!(
            disk = self.shared.disk,
            reads = self.shared.reads_served.load(Ordering::Relaxed),
            writes = self.shared.writes_served.load(Ordering::Relaxed),
            "disk queue stopped"
        );
    }
}

/// Registry of disk queues keyed by disk id.
pub struct DiskQueues {
    inner: Mutex<Registry>,
}

struct Registry {
    queues: HashMap<DiskId, Arc<DiskQueue>>,
    default_priority: PriorityOp,
}

impl DiskQueues {
    /// Creates an empty registry; queues are started on first use.
    pub fn new(default_priority: PriorityOp) -> Self {
        Self {
            inner: Mutex::new(Registry {
                queues: HashMap::new(),
                default_priority,
            }),
        }
    }

    /// Returns the queue of `disk`, starting it if needed.
    pub fn get_or_create(&self, disk: DiskId) -> Result<Arc<DiskQueue>> {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queues.get(&disk) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(DiskQueue::new(disk, inner.default_priority)?);
        inner.queues.insert(disk, Arc::clone(&queue));
        Ok(queue)
    }

    /// Routes a request to the queue of its disk.
    pub fn add_request(&self, request: Request) -> Result<()> {
        self.get_or_create(request.disk())?.add_request(request)
    }

    /// Changes the policy of every running queue and of queues started later.
    pub fn set_priority_op(&self, priority: PriorityOp) {
        let mut inner = self.inner.lock();
        inner.default_priority = priority;
        for queue in inner.queues.values() {
            queue.set_priority_op(priority);
        }
    }

    /// Changes the policy of one disk.
    pub fn set_priority_op_for(&self, disk: DiskId, priority: PriorityOp) -> Result<()> {
        self.get_or_create(disk)?.set_priority_op(priority);
        Ok(())
    }

    pub fn num_queues(&self) -> usize {
        self.inner.lock().queues.len()
    }

    pub fn stats(&self, disk: DiskId) -> Option<DiskQueueStats> {
        self.inner.lock().queues.get(&disk).map(|q| q.stats())
    }

    /// Drains and stops every queue not otherwise referenced.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.lock().queues.drain().collect();
        if !drained.is_empty() {
            info!(queues = drained.len(), "shutting down disk queues");
        }
        drop(drained);
    }
}

impl Drop for DiskQueues {
    fn drop(&mut self) {
        self.shutdown();
    }
}
