pub mod cipher;
pub mod hex;
pub mod sign;

/// Chunk trust primitive consumed by the cache worker.
///
/// `verify` runs on the stored (possibly encrypted) chunk data before any of
/// it is decrypted; `decrypt` must preserve length and is only ever called on
/// data that verified.
pub trait ChunkCrypto: Send + Sync {
    fn signature_len(&self) -> usize;
    fn verify(&self, index: u64, data: &[u8], signature: &[u8]) -> bool;
    fn decrypt(&self, index: u64, data: &[u8], out: &mut [u8]);
}
