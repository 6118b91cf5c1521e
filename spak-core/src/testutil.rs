//! Fixture archives for tests. Sealing lives here only: the library itself
//! never writes archives.

use crate::config::CacheConfig;
use crate::crypto::ChunkCrypto;
use crate::crypto::cipher::CipherKey;
use crate::crypto::sign::{ArchiveKey, SIGNATURE_LEN, chunk_digest};
use crate::source::MemorySource;
use ed25519_dalek::{Signer, SigningKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn archive_key() -> ArchiveKey {
    ArchiveKey::new(signing_key().verifying_key().as_bytes()).unwrap()
}

pub fn sign_chunk(sk: &SigningKey, index: u64, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    sk.sign(&chunk_digest(index, data)).to_bytes()
}

/// Deterministic, non-repeating-per-chunk payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}

/// Lay `plain` out as `[signature][data]` records of `chunk_data_size`.
pub fn seal(plain: &[u8], chunk_data_size: usize, cipher: Option<&CipherKey>) -> Vec<u8> {
    let sk = signing_key();
    let mut out = Vec::new();
    for (index, chunk) in plain.chunks(chunk_data_size).enumerate() {
        let mut data = chunk.to_vec();
        if let Some(c) = cipher {
            c.apply_keystream(index as u64, &mut data);
        }
        out.extend_from_slice(&sign_chunk(&sk, index as u64, &data));
        out.extend_from_slice(&data);
    }
    out
}

pub fn sealed_source(plain: &[u8], chunk_data_size: usize) -> Arc<MemorySource> {
    Arc::new(MemorySource::new(seal(plain, chunk_data_size, None)))
}

pub fn small_config(chunk_data_size: u64, pool_size: usize) -> CacheConfig {
    CacheConfig {
        chunk_data_size,
        pool_size,
        precache_chunks: 0,
    }
}

/// Wraps the real key, counting verifications and optionally slowing them
/// down to widen race windows.
pub struct CountingCrypto {
    inner: ArchiveKey,
    pub verifies: AtomicUsize,
    order: Mutex<Vec<u64>>,
    delay: Duration,
}

impl CountingCrypto {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: archive_key(),
            verifies: AtomicUsize::new(0),
            order: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn count(&self) -> usize {
        self.verifies.load(Ordering::SeqCst)
    }

    /// Chunk indices in the order they were verified.
    pub fn order(&self) -> Vec<u64> {
        self.order.lock().unwrap().clone()
    }
}

impl ChunkCrypto for CountingCrypto {
    fn signature_len(&self) -> usize {
        self.inner.signature_len()
    }

    fn verify(&self, index: u64, data: &[u8], signature: &[u8]) -> bool {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(index);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.verify(index, data, signature)
    }

    fn decrypt(&self, index: u64, data: &[u8], out: &mut [u8]) {
        self.inner.decrypt(index, data, out)
    }
}
