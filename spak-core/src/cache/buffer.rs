use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};
use tracing::error;

/// `owner` value of a buffer that holds no chunk.
pub(crate) const NO_CHUNK: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Holds a verified chunk nobody references; evictable.
    Caching(u64),
    /// Holds a verified chunk referenced by `count` live requests.
    Locked { chunk: u64, count: usize },
}

/// One decrypted chunk. Allocated once with the pool and reused for the
/// worker's whole lifetime; only contents and bookkeeping change.
pub(crate) struct ChunkBuffer {
    data: RwLock<Vec<u8>>,
    owner: AtomicU64,
    lock_count: AtomicUsize,
    last_access: AtomicU64,
}

impl ChunkBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: RwLock::new(Vec::with_capacity(capacity)),
            owner: AtomicU64::new(NO_CHUNK),
            lock_count: AtomicUsize::new(0),
            last_access: AtomicU64::new(0),
        }
    }

    pub fn owner(&self) -> Option<u64> {
        match self.owner.load(Ordering::Acquire) {
            NO_CHUNK => None,
            chunk => Some(chunk),
        }
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::Acquire)
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SlotState {
        match (self.owner(), self.lock_count()) {
            (None, _) => SlotState::Free,
            (Some(chunk), 0) => SlotState::Caching(chunk),
            (Some(chunk), count) => SlotState::Locked { chunk, count },
        }
    }

    /// Copy `dest.len()` bytes starting at `offset`. Only meaningful while the
    /// caller holds a lock on this buffer.
    pub fn copy_out(&self, offset: usize, dest: &mut [u8]) -> bool {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        match offset
            .checked_add(dest.len())
            .and_then(|end| data.get(offset..end))
        {
            Some(src) => {
                dest.copy_from_slice(src);
                true
            }
            None => false,
        }
    }
}

/// Fixed arena of chunk buffers addressed by slot index.
///
/// Only the worker thread assigns, fills, and locks slots; reader threads
/// only unlock them (through request release) and read locked contents.
pub(crate) struct BufferPool {
    slots: Vec<ChunkBuffer>,
    capacity: usize,
    clock: AtomicU64,
    released: Mutex<()>,
    released_cv: Condvar,
}

impl BufferPool {
    pub fn new(pool_size: usize, capacity: usize) -> Self {
        Self {
            slots: (0..pool_size).map(|_| ChunkBuffer::new(capacity)).collect(),
            capacity,
            clock: AtomicU64::new(0),
            released: Mutex::new(()),
            released_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn slot(&self, slot: usize) -> &ChunkBuffer {
        &self.slots[slot]
    }

    pub fn states(&self) -> Vec<SlotState> {
        self.slots.iter().map(ChunkBuffer::state).collect()
    }

    pub fn find_cached(&self, chunk: u64) -> Option<usize> {
        self.slots.iter().position(|b| b.owner() == Some(chunk))
    }

    /// Unlocked slot with the oldest access tick. Never-used slots have tick 0
    /// and therefore go first.
    pub fn least_recent_unlocked(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, b)| b.lock_count() == 0)
            .min_by_key(|(_, b)| b.last_access())
            .map(|(i, _)| i)
    }

    /// Block until some slot is unlocked, or return `None` once `stopping`
    /// is raised. `on_stall` runs once if the first check finds every slot
    /// locked. Whoever unlocks a slot or raises `stopping` must call `wake`
    /// afterwards; it takes the same mutex, so the signal cannot be missed.
    pub fn wait_for_victim(
        &self,
        stopping: &AtomicBool,
        mut on_stall: impl FnMut(),
    ) -> Option<usize> {
        let mut guard = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stalled = false;
        loop {
            if stopping.load(Ordering::Acquire) {
                return None;
            }
            if let Some(slot) = self.least_recent_unlocked() {
                return Some(slot);
            }
            if !stalled {
                stalled = true;
                on_stall();
            }
            guard = self
                .released_cv
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Forget the slot's chunk ahead of reassignment. Returns the chunk it
    /// held, if any.
    pub fn evict(&self, slot: usize) -> Option<u64> {
        let buf = &self.slots[slot];
        debug_assert_eq!(buf.lock_count(), 0, "evicting a locked buffer");
        match buf.owner.swap(NO_CHUNK, Ordering::AcqRel) {
            NO_CHUNK => None,
            chunk => Some(chunk),
        }
    }

    /// Size the slot to `len` bytes, let `fill` write them, then publish the
    /// slot as caching `chunk`.
    pub fn fill(&self, slot: usize, chunk: u64, len: usize, fill: impl FnOnce(&mut [u8])) {
        let buf = &self.slots[slot];
        {
            let mut data = buf.data.write().unwrap_or_else(PoisonError::into_inner);
            data.clear();
            data.resize(len, 0);
            fill(&mut data);
        }
        buf.owner.store(chunk, Ordering::Release);
    }

    pub fn lock(&self, slot: usize) {
        let buf = &self.slots[slot];
        buf.lock_count.fetch_add(1, Ordering::AcqRel);
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        buf.last_access.store(tick, Ordering::Release);
    }

    pub fn unlock(&self, slot: usize) {
        let prev = self.slots[slot]
            .lock_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.wake(),
            Ok(_) => {}
            Err(_) => error!(slot, "unlock of an unlocked chunk buffer"),
        }
    }

    /// Wake a worker stalled in `wait_for_victim`.
    pub fn wake(&self) {
        let _guard = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        self.released_cv.notify_all();
    }
}
