use super::worker::Shared;
use crate::error::{Result, SpakError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Why a request will never become ready. Kept clonable so every waiter on a
/// shared request observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    /// `chunk` failed verification. It may differ from the request's own
    /// chunk once the archive as a whole is known to be tampered.
    Tampered {
        chunk: u64,
    },
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    Stopped,
}

impl Failure {
    pub fn io(e: &std::io::Error) -> Self {
        Failure::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }

    fn into_error(self) -> SpakError {
        match self {
            Failure::Tampered { chunk } => SpakError::Tampered { chunk },
            Failure::Io { kind, message } => std::io::Error::new(kind, message).into(),
            Failure::Stopped => SpakError::Stopped,
        }
    }
}

#[derive(Debug)]
enum Status {
    Pending,
    /// Verified and decrypted into pool slot `slot`, which holds a lock for
    /// this request.
    Ready { slot: usize },
    Failed(Failure),
    /// Every reference went away while still pending.
    Abandoned,
    /// Every reference went away after resolving; the slot lock is returned.
    Released,
}

/// Outcome of dropping the last reference.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Retired {
    /// The request held a lock on this slot, which must now be unlocked.
    Slot(usize),
    NoSlot,
    /// Someone else already retired it.
    Already,
}

/// One logical chunk fetch, shared by every caller interested in the chunk.
///
/// `index`, `offset`, and `size` are written before the request is handed to
/// anyone (or while it sits unshared in the free pool) and never change while
/// shared.
#[derive(Debug)]
pub(crate) struct ChunkRequest {
    index: u64,
    offset: u64,
    size: u64,
    refs: AtomicUsize,
    status: Mutex<Status>,
    settled: Condvar,
}

impl ChunkRequest {
    /// A pending request with one reference, held by the caller.
    pub fn new(index: u64, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            refs: AtomicUsize::new(1),
            status: Mutex::new(Status::Pending),
            settled: Condvar::new(),
        }
    }

    /// Reuse a request from the free pool. Requires exclusive access.
    pub fn reset(&mut self, index: u64, offset: u64, size: u64) {
        self.index = index;
        self.offset = offset;
        self.size = size;
        *self.refs.get_mut() = 1;
        *self.status.get_mut().unwrap_or_else(PoisonError::into_inner) = Status::Pending;
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; true if it was the last.
    pub fn drop_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(*self.status(), Status::Abandoned)
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.status(), Status::Pending)
    }

    pub fn is_verified(&self) -> bool {
        matches!(*self.status(), Status::Ready { .. })
    }

    pub fn slot(&self) -> Option<usize> {
        match *self.status() {
            Status::Ready { slot } => Some(slot),
            _ => None,
        }
    }

    /// Worker side: attach `slot` and wake waiters. The slot's contents are
    /// complete before this is called; the status mutex orders them before
    /// any waiter's read. Returns false if nobody wants the chunk any more,
    /// in which case the caller still owns the slot lock.
    pub fn publish(&self, slot: usize) -> bool {
        let mut status = self.status();
        match *status {
            Status::Pending => {
                *status = Status::Ready { slot };
                drop(status);
                self.settled.notify_all();
                true
            }
            _ => false,
        }
    }

    pub fn fail(&self, failure: Failure) {
        let mut status = self.status();
        if matches!(*status, Status::Pending) {
            *status = Status::Failed(failure);
            drop(status);
            self.settled.notify_all();
        }
    }

    /// Called once the reference count reached zero.
    pub fn retire(&self) -> Retired {
        let mut status = self.status();
        let (next, retired) = match *status {
            Status::Pending => (Status::Abandoned, Retired::NoSlot),
            Status::Ready { slot } => (Status::Released, Retired::Slot(slot)),
            Status::Failed(_) => (Status::Released, Retired::NoSlot),
            Status::Abandoned | Status::Released => return Retired::Already,
        };
        *status = next;
        retired
    }

    /// Block until the worker settles this request. Never call from the
    /// worker thread.
    pub fn wait(&self) -> Result<usize> {
        let mut status = self.status();
        loop {
            match &*status {
                Status::Pending => {}
                Status::Ready { slot } => return Ok(*slot),
                Status::Failed(f) => return Err(f.clone().into_error()),
                // a live handle keeps refs > 0, so callers never get here
                Status::Abandoned | Status::Released => return Err(SpakError::Stopped),
            }
            status = self
                .settled
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Caller's reference to a chunk request. Dropping it releases the chunk.
pub struct ChunkHandle {
    request: Arc<ChunkRequest>,
    shared: Arc<Shared>,
}

impl ChunkHandle {
    /// Takes over a reference the caller already counted.
    pub(crate) fn new(request: Arc<ChunkRequest>, shared: Arc<Shared>) -> Self {
        Self { request, shared }
    }

    pub fn index(&self) -> u64 {
        self.request.index()
    }

    /// On-disk offset of the chunk (its signature).
    pub fn offset(&self) -> u64 {
        self.request.offset()
    }

    /// Logical bytes in the chunk.
    pub fn size(&self) -> u64 {
        self.request.size()
    }

    /// True once `wait_until_ready` would return without blocking, whether
    /// the chunk verified or failed.
    pub fn is_ready(&self) -> bool {
        self.request.is_settled()
    }

    pub fn is_verified(&self) -> bool {
        self.request.is_verified()
    }

    pub fn wait_until_ready(&self) -> Result<()> {
        self.request.wait().map(|_| ())
    }

    /// Wait for the chunk, then copy `dest.len()` decrypted bytes starting at
    /// `offset` within the chunk.
    pub fn copy_to(&self, offset: u64, dest: &mut [u8]) -> Result<()> {
        let slot = self.request.wait()?;
        let buf = self.shared.pool().slot(slot);
        debug_assert_eq!(buf.owner(), Some(self.index()));
        let copied = usize::try_from(offset)
            .map(|offset| buf.copy_out(offset, dest))
            .unwrap_or(false);
        if !copied {
            return Err(SpakError::Format(format!(
                "range {}+{} outside chunk {} ({} bytes)",
                offset,
                dest.len(),
                self.index(),
                self.size()
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn slot(&self) -> Option<usize> {
        self.request.slot()
    }

    #[cfg(test)]
    pub(crate) fn same_request(&self, other: &ChunkHandle) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }
}

impl Clone for ChunkHandle {
    fn clone(&self) -> Self {
        self.request.acquire();
        Self {
            request: self.request.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        self.shared.release(&self.request);
    }
}

impl std::fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkHandle")
            .field("index", &self.index())
            .field("size", &self.size())
            .field("ready", &self.is_ready())
            .finish()
    }
}
