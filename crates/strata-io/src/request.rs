//! Asynchronous I/O requests.
//!
//! A `Request` is a shared handle to one outstanding read or write. The
//! issuing code, the disk queue and any waiters each hold a clone; the
//! request is freed when the last clone is dropped. The buffer is moved into
//! the request on submission and handed back once the request is done.

use crate::file::FileBackend;
use crate::switch::OnOffSwitch;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use strata_common::{Bid, DiskId, Result, StrataError};
use tracing::{debug, error};

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    fn op_name(self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write => "write",
        }
    }
}

/// Lifecycle state of a request.
///
/// `Operating` until the worker has performed the I/O and run the completion
/// handler, then `Done` while waiters are notified, then `ReadyToDestroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Operating,
    Done,
    ReadyToDestroy,
}

/// Callback run exactly once on the worker thread that served the request.
pub type CompletionHandler = Box<dyn FnOnce(&Request) + Send + 'static>;

struct Status {
    state: RequestState,
    buffer: Option<Vec<u8>>,
    error: Option<String>,
    handler: Option<CompletionHandler>,
    waiters: Vec<Arc<OnOffSwitch>>,
}

struct Inner {
    file: Arc<dyn FileBackend>,
    kind: RequestKind,
    offset: u64,
    len: usize,
    status: Mutex<Status>,
    cond: Condvar,
}

/// Shared handle to an asynchronous read or write.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

impl Request {
    pub(crate) fn new(
        file: Arc<dyn FileBackend>,
        kind: RequestKind,
        buffer: Vec<u8>,
        offset: u64,
        handler: Option<CompletionHandler>,
    ) -> Self {
        let len = buffer.len();
        Self {
            inner: Arc::new(Inner {
                file,
                kind,
                offset,
                len,
                status: Mutex::new(Status {
                    state: RequestState::Operating,
                    buffer: Some(buffer),
                    error: None,
                    handler,
                    waiters: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    /// Block addressed by the request.
    pub fn bid(&self) -> Bid {
        Bid::new(self.inner.file.id(), self.inner.offset)
    }

    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    /// Transfer size in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Disk whose queue serves the request.
    pub fn disk(&self) -> DiskId {
        self.inner.file.disk()
    }

    pub fn state(&self) -> RequestState {
        self.inner.status.lock().state
    }

    /// Number of live handles to this request.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns true once the request has completed. A failed request yields
    /// its error to every caller that polls it.
    pub fn poll(&self) -> Result<bool> {
        let status = self.inner.status.lock();
        if status.state == RequestState::Operating {
            return Ok(false);
        }
        self.check_error(&status)?;
        Ok(true)
    }

    /// Blocks until the request has completed and its waiters were notified.
    pub fn wait(&self) -> Result<()> {
        let mut status = self.inner.status.lock();
        while status.state != RequestState::ReadyToDestroy {
            self.inner.cond.wait(&mut status);
        }
        self.check_error(&status)
    }

    /// Waits for completion and takes the buffer back.
    pub fn wait_buffer(&self) -> Result<Vec<u8>> {
        self.wait()?;
        self.take_buffer().ok_or_else(|| {
            StrataError::Internal(format!("buffer of request {} already taken", self.bid()))
        })
    }

    /// Takes the buffer back from a completed request. Returns `None` while
    /// the request is operating or when the buffer was already taken.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        let mut status = self.inner.status.lock();
        if status.state == RequestState::Operating {
            return None;
        }
        status.buffer.take()
    }

    /// Failure message recorded by the worker, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.status.lock().error.clone()
    }

    fn check_error(&self, status: &Status) -> Result<()> {
        match &status.error {
            Some(reason) => Err(StrataError::RequestFailed {
                op: self.inner.kind.op_name(),
                bid: self.bid(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Registers `switch` to be turned on at completion. Returns true, and
    /// registers nothing, when the request has already completed.
    pub(crate) fn add_waiter(&self, switch: &Arc<OnOffSwitch>) -> bool {
        let mut status = self.inner.status.lock();
        if status.state != RequestState::Operating {
            return true;
        }
        status.waiters.push(Arc::clone(switch));
        false
    }

    pub(crate) fn delete_waiter(&self, switch: &Arc<OnOffSwitch>) {
        let mut status = self.inner.status.lock();
        status.waiters.retain(|w| !Arc::ptr_eq(w, switch));
    }

    /// Performs the I/O and completes the request. Called by the disk queue
    /// worker, never by the submitting thread.
    pub(crate) fn serve(&self) {
        let mut buffer = self.inner.status.lock().buffer.take().unwrap_or_default();

        let outcome = match self.inner.kind {
            RequestKind::Read => self.inner.file.serve_read(&mut buffer, self.inner.offset),
            RequestKind::Write => self.inner.file.serve_write(&buffer, self.inner.offset),
        };
        if let Err(e) = &outcome {
            error!(
                op = self.inner.kind.op_name(),
                bid = %self.bid(),
                len = self.inner.len,
                error = %e,
                "request failed"
            );
        } else {
            debug!(op = self.inner.kind.op_name(), bid = %self.bid(), "request served");
        }

        let handler = {
            let mut status = self.inner.status.lock();
            status.buffer = Some(buffer);
            status.error = outcome.err().map(|e| e.to_string());
            status.handler.take()
        };

        if let Some(handler) = handler {
            handler(self);
        }

        let waiters = {
            let mut status = self.inner.status.lock();
            status.state = RequestState::Done;
            std::mem::take(&mut status.waiters)
        };
        for waiter in waiters {
            waiter.on();
        }

        let mut status = self.inner.status.lock();
        status.state = RequestState::ReadyToDestroy;
        self.inner.cond.notify_all();
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.inner.kind)
            .field("bid", &self.bid())
            .field("len", &self.inner.len)
            .field("state", &self.state())
            .finish()
    }
}
