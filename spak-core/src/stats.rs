use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the worker's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub requests: u64,
    /// Requests served by an already active request for the same chunk.
    pub coalesced: u64,
    /// Requests served from a buffer that still held the chunk.
    pub cache_hits: u64,
    /// Chunks that passed signature verification and were decrypted.
    pub verified: u64,
    pub failures: u64,
    pub evictions: u64,
    /// Times the worker waited because every buffer was locked.
    pub stalls: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub requests: AtomicU64,
    pub coalesced: AtomicU64,
    pub cache_hits: AtomicU64,
    pub verified: AtomicU64,
    pub failures: AtomicU64,
    pub evictions: AtomicU64,
    pub stalls: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            requests: self.requests.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
        }
    }
}
