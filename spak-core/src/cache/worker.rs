use super::buffer::{BufferPool, NO_CHUNK, SlotState};
use super::request::{ChunkHandle, ChunkRequest, Failure, Retired};
use crate::config::CacheConfig;
use crate::container::layout::ChunkLayout;
use crate::crypto::ChunkCrypto;
use crate::error::{Result, SpakError};
use crate::source::ByteSource;
use crate::stats::{Counters, Stats};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Retired requests kept around for reuse.
const FREE_REQUESTS: usize = 32;

#[derive(Default)]
struct Queue {
    /// FIFO of requests the worker has not looked at yet.
    pending: VecDeque<Arc<ChunkRequest>>,
    /// Live requests by chunk index; duplicate requests coalesce here.
    active: HashMap<u64, Arc<ChunkRequest>>,
    free: Vec<Arc<ChunkRequest>>,
}

impl Queue {
    fn take_request(&mut self, index: u64, offset: u64, size: u64) -> Arc<ChunkRequest> {
        while let Some(mut request) = self.free.pop() {
            // a stale clone (e.g. still in the worker's batch) blocks reuse
            if let Some(r) = Arc::get_mut(&mut request) {
                r.reset(index, offset, size);
                return request;
            }
        }
        Arc::new(ChunkRequest::new(index, offset, size))
    }
}

/// State shared by the worker thread, the worker handle, and chunk handles.
pub(crate) struct Shared {
    source: Arc<dyn ByteSource>,
    crypto: Arc<dyn ChunkCrypto>,
    pool: BufferPool,
    queue: Mutex<Queue>,
    queued: Condvar,
    /// Only raised while holding the queue lock.
    stopping: AtomicBool,
    /// First chunk that failed verification, or `NO_CHUNK`. Once set, the
    /// archive serves nothing more.
    tampered: AtomicU64,
    counters: Counters,
}

/// Fails everything outstanding if the worker thread unwinds, so no reader
/// is left waiting on a request nobody will settle.
struct UnwindGuard<'a>(&'a Shared);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("chunk cache worker panicked; failing outstanding requests");
            self.0.fail_outstanding();
        }
    }
}

impl Shared {
    #[inline]
    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tampered_chunk(&self) -> Option<u64> {
        match self.tampered.load(Ordering::Acquire) {
            NO_CHUNK => None,
            chunk => Some(chunk),
        }
    }

    /// Refuse new requests and fail every queued or in-flight one.
    fn fail_outstanding(&self) {
        let outstanding: Vec<_> = {
            let mut q = self.lock_queue();
            self.stopping.store(true, Ordering::Release);
            let mut all: Vec<_> = q.pending.drain(..).collect();
            all.extend(q.active.values().cloned());
            all
        };
        self.queued.notify_all();
        self.pool.wake();
        for request in outstanding {
            request.fail(Failure::Stopped);
        }
    }

    /// Drop one reference to `request`. The last reference removes it from
    /// the active set, unlocks its buffer, and recycles it.
    pub(crate) fn release(&self, request: &Arc<ChunkRequest>) {
        if !request.drop_ref() {
            return;
        }
        let retired = {
            let mut q = self.lock_queue();
            // request_chunk may have revived it before we got the lock
            if request.refs() != 0 {
                return;
            }
            let index = request.index();
            if q.active.get(&index).is_some_and(|a| Arc::ptr_eq(a, request)) {
                q.active.remove(&index);
            }
            let retired = request.retire();
            if retired != Retired::Already && q.free.len() < FREE_REQUESTS {
                q.free.push(request.clone());
            }
            retired
        };
        if let Retired::Slot(slot) = retired {
            self.pool.unlock(slot);
        }
    }

    fn next_batch(&self) -> Option<Vec<Arc<ChunkRequest>>> {
        let mut q = self.lock_queue();
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return None;
            }
            if !q.pending.is_empty() {
                return Some(q.pending.drain(..).collect());
            }
            q = self
                .queued
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn run(&self) {
        debug!(buffers = self.pool.len(), "chunk cache worker started");
        let _guard = UnwindGuard(self);
        let mut scratch = Vec::with_capacity(self.crypto.signature_len() + self.pool.capacity());
        while let Some(batch) = self.next_batch() {
            for request in batch {
                if self.stopping.load(Ordering::Acquire) {
                    request.fail(Failure::Stopped);
                    continue;
                }
                self.process(&request, &mut scratch);
            }
        }
        let abandoned: Vec<_> = self.lock_queue().pending.drain(..).collect();
        for request in abandoned {
            request.fail(Failure::Stopped);
        }
        debug!("chunk cache worker stopped");
    }

    fn process(&self, request: &ChunkRequest, scratch: &mut Vec<u8>) {
        if request.is_abandoned() {
            trace!(chunk = request.index(), "skipping abandoned chunk request");
            return;
        }
        if let Some(chunk) = self.tampered_chunk() {
            request.fail(Failure::Tampered { chunk });
            return;
        }
        match self.load(request, scratch) {
            Ok(slot) => {
                if request.publish(slot) {
                    trace!(chunk = request.index(), slot, "chunk ready");
                } else {
                    self.pool.unlock(slot);
                }
            }
            Err(failure) => request.fail(failure),
        }
    }

    /// Put the request's chunk in a buffer and lock it on the request's
    /// behalf. Nothing is decrypted into a buffer unless its signature holds.
    fn load(
        &self,
        request: &ChunkRequest,
        scratch: &mut Vec<u8>,
    ) -> std::result::Result<usize, Failure> {
        let index = request.index();
        if let Some(slot) = self.pool.find_cached(index) {
            self.pool.lock(slot);
            Counters::bump(&self.counters.cache_hits);
            trace!(chunk = index, slot, "chunk cache hit");
            return Ok(slot);
        }

        let slot = self
            .pool
            .wait_for_victim(&self.stopping, || {
                Counters::bump(&self.counters.stalls);
                debug!(
                    chunk = index,
                    buffers = self.pool.len(),
                    "all chunk buffers locked; waiting for a release"
                );
            })
            .ok_or(Failure::Stopped)?;
        if let Some(evicted) = self.pool.evict(slot) {
            Counters::bump(&self.counters.evictions);
            debug!(chunk = index, evicted, slot, "evicting cached chunk");
        }

        let size = request.size() as usize;
        let sig_len = self.crypto.signature_len();
        scratch.clear();
        scratch.resize(sig_len + size, 0);
        if let Err(e) = self.source.read_exact_at(request.offset(), scratch) {
            Counters::bump(&self.counters.failures);
            warn!(chunk = index, offset = request.offset(), error = %e, "chunk read failed");
            return Err(Failure::io(&e));
        }

        let (signature, data) = scratch.split_at(sig_len);
        if !self.crypto.verify(index, data, signature) {
            Counters::bump(&self.counters.failures);
            if self
                .tampered
                .compare_exchange(NO_CHUNK, index, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                error!(chunk = index, "chunk signature verification failed; archive is tampered");
            }
            return Err(Failure::Tampered { chunk: index });
        }
        Counters::bump(&self.counters.verified);

        self.pool
            .fill(slot, index, size, |out| self.crypto.decrypt(index, data, out));
        self.pool.lock(slot);
        Ok(slot)
    }
}

/// Background verifier for one archive. Serves any number of readers on any
/// number of threads; each chunk is verified once per time it is cached.
pub struct ChunkCacheWorker {
    shared: Arc<Shared>,
    chunk_data_size: u64,
    precache_chunks: usize,
    max_in_flight: usize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ChunkCacheWorker {
    pub fn new(
        source: Arc<dyn ByteSource>,
        crypto: Arc<dyn ChunkCrypto>,
        config: &CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            source,
            crypto,
            pool: BufferPool::new(config.pool_size, config.chunk_data_size as usize),
            queue: Mutex::new(Queue::default()),
            queued: Condvar::new(),
            stopping: AtomicBool::new(false),
            tampered: AtomicU64::new(NO_CHUNK),
            counters: Counters::default(),
        });
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("spak-chunk-cache".into())
                .spawn(move || shared.run())?
        };
        Ok(Self {
            shared,
            chunk_data_size: config.chunk_data_size,
            precache_chunks: config.precache_chunks,
            max_in_flight: config.max_in_flight(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Ask for chunk `index`, stored at raw `offset` with `size` logical
    /// bytes. A request already live for `index` is shared instead of queued
    /// again. The returned handle holds one reference.
    pub fn request_chunk(&self, index: u64, offset: u64, size: u64) -> Result<ChunkHandle> {
        if size > self.chunk_data_size {
            return Err(SpakError::Format(format!(
                "chunk {index} size {size} exceeds chunk data size {}",
                self.chunk_data_size
            )));
        }
        let shared = &self.shared;
        let mut q = shared.lock_queue();
        if shared.stopping.load(Ordering::Acquire) {
            return Err(SpakError::Stopped);
        }
        if let Some(chunk) = shared.tampered_chunk() {
            return Err(SpakError::Tampered { chunk });
        }
        Counters::bump(&shared.counters.requests);

        if let Some(existing) = q.active.get(&index) {
            existing.acquire();
            Counters::bump(&shared.counters.coalesced);
            trace!(chunk = index, refs = existing.refs(), "coalesced chunk request");
            return Ok(ChunkHandle::new(existing.clone(), shared.clone()));
        }

        let request = q.take_request(index, offset, size);
        q.active.insert(index, request.clone());
        q.pending.push_back(request.clone());
        drop(q);
        shared.queued.notify_one();
        trace!(chunk = index, offset, size, "queued chunk request");
        Ok(ChunkHandle::new(request, shared.clone()))
    }

    /// Same as dropping the handle.
    pub fn release_chunk(&self, handle: ChunkHandle) {
        drop(handle);
    }

    /// Stop the worker thread and fail everything still queued. Idempotent.
    pub fn stop(&self) {
        {
            let _q = self.shared.lock_queue();
            self.shared.stopping.store(true, Ordering::Release);
        }
        self.shared.queued.notify_all();
        self.shared.pool.wake();

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("chunk cache worker panicked");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// The chunk whose failed verification shut this archive down, if any.
    pub fn tampered_chunk(&self) -> Option<u64> {
        self.shared.tampered_chunk()
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }

    pub fn buffer_states(&self) -> Vec<SlotState> {
        self.shared.pool.states()
    }

    pub fn signature_len(&self) -> usize {
        self.shared.crypto.signature_len()
    }

    pub fn chunk_data_size(&self) -> u64 {
        self.chunk_data_size
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool.len()
    }

    pub fn precache_chunks(&self) -> usize {
        self.precache_chunks
    }

    /// Most chunk handles one reader should hold at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn layout_for(&self, source: &dyn ByteSource) -> Result<ChunkLayout> {
        ChunkLayout::new(
            source.total_size(),
            self.chunk_data_size,
            self.signature_len() as u64,
        )
    }
}

impl Drop for ChunkCacheWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ChunkCacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCacheWorker")
            .field("chunk_data_size", &self.chunk_data_size)
            .field("pool_size", &self.pool_size())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::testutil::{CountingCrypto, pattern, seal, small_config};
    use std::thread;
    use std::time::Duration;

    const C: usize = 100;

    fn setup(
        sealed: Vec<u8>,
        pool_size: usize,
        delay: Duration,
    ) -> (Arc<CountingCrypto>, ChunkCacheWorker, ChunkLayout) {
        let crypto = Arc::new(CountingCrypto::new(delay));
        let source = Arc::new(MemorySource::new(sealed));
        let worker = ChunkCacheWorker::new(
            source.clone(),
            crypto.clone(),
            &small_config(C as u64, pool_size),
        )
        .unwrap();
        let layout = worker.layout_for(source.as_ref()).unwrap();
        (crypto, worker, layout)
    }

    fn request(worker: &ChunkCacheWorker, layout: &ChunkLayout, index: u64) -> ChunkHandle {
        worker
            .request_chunk(index, layout.raw_offset(index), layout.chunk_size(index))
            .unwrap()
    }

    #[test]
    fn serves_decrypted_chunk_bytes() {
        let plain = pattern(3 * C + 40);
        let (_, worker, layout) = setup(seal(&plain, C, None), 4, Duration::ZERO);
        let h = request(&worker, &layout, 3);
        h.wait_until_ready().unwrap();
        assert!(h.is_verified());
        let mut out = vec![0u8; 40];
        h.copy_to(0, &mut out).unwrap();
        assert_eq!(out, &plain[3 * C..]);
        assert!(h.copy_to(1, &mut out).is_err());
    }

    #[test]
    fn duplicate_requests_coalesce_onto_one_verification() {
        let plain = pattern(4 * C);
        let (crypto, worker, layout) = setup(seal(&plain, C, None), 4, Duration::from_millis(20));

        let a = request(&worker, &layout, 2);
        let b = request(&worker, &layout, 2);
        assert!(a.same_request(&b));
        a.wait_until_ready().unwrap();
        b.wait_until_ready().unwrap();

        assert_eq!(a.slot(), b.slot());
        assert_eq!(crypto.count(), 1);
        let stats = worker.stats();
        assert_eq!(stats.verified, 1);
        assert_eq!(stats.coalesced, 1);
    }

    #[test]
    fn full_pool_stalls_instead_of_overwriting_locked_buffers() {
        let plain = pattern(4 * C);
        let (_, worker, layout) = setup(seal(&plain, C, None), 2, Duration::ZERO);

        let h0 = request(&worker, &layout, 0);
        let h1 = request(&worker, &layout, 1);
        h0.wait_until_ready().unwrap();
        h1.wait_until_ready().unwrap();
        let slot0 = h0.slot();

        let h2 = request(&worker, &layout, 2);
        thread::sleep(Duration::from_millis(100));
        assert!(!h2.is_ready());
        let mut locked: Vec<_> = worker
            .buffer_states()
            .into_iter()
            .map(|s| match s {
                SlotState::Locked { chunk, count } => (chunk, count),
                other => panic!("unexpected slot state {other:?}"),
            })
            .collect();
        locked.sort();
        assert_eq!(locked, vec![(0, 1), (1, 1)]);

        drop(h0);
        h2.wait_until_ready().unwrap();
        assert_eq!(h2.slot(), slot0);
        let mut out = vec![0u8; C];
        h2.copy_to(0, &mut out).unwrap();
        assert_eq!(out, &plain[2 * C..3 * C]);
        h1.copy_to(0, &mut out).unwrap();
        assert_eq!(out, &plain[C..2 * C]);
        assert!(worker.stats().stalls >= 1);
    }

    #[test]
    fn tampered_chunk_fails_and_is_never_cached() {
        let plain = pattern(3 * C);
        let mut sealed = seal(&plain, C, None);
        // one data byte inside chunk 1
        sealed[164 + 64 + 17] ^= 0x01;
        let (crypto, worker, layout) = setup(sealed, 4, Duration::ZERO);

        let bad = request(&worker, &layout, 1);
        let queued = request(&worker, &layout, 2);
        assert!(matches!(
            bad.wait_until_ready(),
            Err(SpakError::Tampered { chunk: 1 })
        ));
        assert!(bad.is_ready());
        assert!(!bad.is_verified());

        let mut out = vec![0xAAu8; 10];
        assert!(bad.copy_to(0, &mut out).unwrap_err().is_tampered());
        assert_eq!(out, vec![0xAAu8; 10]);
        assert!(
            worker
                .buffer_states()
                .iter()
                .all(|s| matches!(s, SlotState::Free))
        );

        // the archive is dead: queued and later requests report the bad chunk
        assert!(matches!(
            queued.wait_until_ready(),
            Err(SpakError::Tampered { chunk: 1 })
        ));
        assert_eq!(worker.tampered_chunk(), Some(1));
        assert!(matches!(
            worker.request_chunk(0, layout.raw_offset(0), C as u64),
            Err(SpakError::Tampered { chunk: 1 })
        ));
        assert_eq!(crypto.count(), 1);
        assert_eq!(worker.stats().failures, 1);
    }

    #[test]
    fn evicted_chunk_is_verified_again() {
        let plain = pattern(3 * C);
        let (crypto, worker, layout) = setup(seal(&plain, C, None), 1, Duration::ZERO);

        request(&worker, &layout, 0).wait_until_ready().unwrap();
        assert_eq!(worker.buffer_states(), vec![SlotState::Caching(0)]);

        // still cached: no second verification
        request(&worker, &layout, 0).wait_until_ready().unwrap();
        assert_eq!(crypto.count(), 1);
        assert_eq!(worker.stats().cache_hits, 1);

        request(&worker, &layout, 2).wait_until_ready().unwrap();
        assert_eq!(worker.buffer_states(), vec![SlotState::Caching(2)]);

        let h = request(&worker, &layout, 0);
        h.wait_until_ready().unwrap();
        assert_eq!(crypto.count(), 3);
        assert_eq!(worker.stats().evictions, 2);
        let mut out = vec![0u8; C];
        h.copy_to(0, &mut out).unwrap();
        assert_eq!(out, &plain[..C]);
    }

    #[test]
    fn short_source_surfaces_as_io_error() {
        let plain = pattern(2 * C);
        let (_, worker, _) = setup(seal(&plain, C, None), 2, Duration::ZERO);
        let h = worker.request_chunk(7, 7 * 164, C as u64).unwrap();
        match h.wait_until_ready() {
            Err(SpakError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected I/O error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_request_is_rejected() {
        let (_, worker, _) = setup(seal(&pattern(C), C, None), 2, Duration::ZERO);
        assert!(matches!(
            worker.request_chunk(0, 0, C as u64 + 1),
            Err(SpakError::Format(_))
        ));
    }

    #[test]
    fn dropping_pending_request_leaks_no_buffer() {
        let plain = pattern(4 * C);
        let (crypto, worker, layout) = setup(seal(&plain, C, None), 2, Duration::from_millis(20));

        let h0 = request(&worker, &layout, 0);
        drop(request(&worker, &layout, 1));
        h0.wait_until_ready().unwrap();
        drop(h0);
        // let the worker finish whatever it had queued
        request(&worker, &layout, 3).wait_until_ready().unwrap();

        assert!(
            worker
                .buffer_states()
                .iter()
                .all(|s| !matches!(s, SlotState::Locked { .. }))
        );
        assert!(crypto.count() <= 3);
    }

    #[test]
    fn stop_fails_waiters_and_later_requests() {
        let plain = pattern(3 * C);
        let (_, worker, layout) = setup(seal(&plain, C, None), 1, Duration::ZERO);

        let h0 = request(&worker, &layout, 0);
        h0.wait_until_ready().unwrap();
        let stalled = request(&worker, &layout, 1);
        let waiter = {
            let stalled = stalled.clone();
            thread::spawn(move || stalled.wait_until_ready())
        };
        thread::sleep(Duration::from_millis(30));

        worker.stop();
        assert!(matches!(waiter.join().unwrap(), Err(SpakError::Stopped)));
        assert!(matches!(
            worker.request_chunk(2, layout.raw_offset(2), C as u64),
            Err(SpakError::Stopped)
        ));
        // resolved chunks stay readable until released
        let mut out = vec![0u8; 4];
        h0.copy_to(0, &mut out).unwrap();
        assert_eq!(out, &plain[..4]);
        worker.stop();
    }

    struct PanickingCrypto;

    impl ChunkCrypto for PanickingCrypto {
        fn signature_len(&self) -> usize {
            64
        }

        fn verify(&self, _index: u64, _data: &[u8], _signature: &[u8]) -> bool {
            panic!("verifier exploded");
        }

        fn decrypt(&self, _index: u64, data: &[u8], out: &mut [u8]) {
            out.copy_from_slice(data);
        }
    }

    #[test]
    fn worker_panic_fails_waiters_instead_of_hanging() {
        let source = Arc::new(MemorySource::new(seal(&pattern(2 * C), C, None)));
        let worker =
            ChunkCacheWorker::new(source.clone(), Arc::new(PanickingCrypto), &small_config(C as u64, 2))
                .unwrap();
        let layout = worker.layout_for(source.as_ref()).unwrap();

        let h = request(&worker, &layout, 0);
        let twin = h.clone();
        let waiter = thread::spawn(move || twin.wait_until_ready());
        assert!(matches!(h.wait_until_ready(), Err(SpakError::Stopped)));
        assert!(matches!(waiter.join().unwrap(), Err(SpakError::Stopped)));

        assert!(worker.is_stopped());
        assert!(matches!(
            worker.request_chunk(1, layout.raw_offset(1), C as u64),
            Err(SpakError::Stopped)
        ));
    }

    #[test]
    fn released_requests_are_recycled() {
        let plain = pattern(2 * C);
        let (_, worker, layout) = setup(seal(&plain, C, None), 2, Duration::ZERO);
        for _ in 0..5 {
            for i in 0..2 {
                request(&worker, &layout, i).wait_until_ready().unwrap();
            }
        }
        assert!(worker.shared.lock_queue().free.len() <= FREE_REQUESTS);
        assert!(worker.shared.lock_queue().active.is_empty());
        assert_eq!(worker.stats().verified, 2);
    }
}
