use blake3::Hasher;
use chacha20::{
    Key, XChaCha20, XNonce,
    cipher::{KeyIvInit, StreamCipher},
};

pub const KEY_LEN: usize = 32;

/// Domain separation for chunk nonces.
const NONCE_DOMAIN: &[u8] = b"spak/chunk-nonce/v1";

/// Keys: raw 32-byte key plus the salt the archive was sealed with.
#[derive(Clone)]
pub struct CipherKey {
    key: [u8; KEY_LEN],
    salt: [u8; 32],
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey").finish_non_exhaustive()
    }
}

/// Nonce derivation: XChaCha requires a 24-byte nonce.
/// nonce = blake3(salt || domain || chunk_index).take(24)
pub fn derive_nonce(salt: &[u8; 32], chunk_index: u64) -> XNonce {
    let mut h = Hasher::new();
    h.update(salt);
    h.update(NONCE_DOMAIN);
    h.update(&chunk_index.to_le_bytes());
    let out = h.finalize();
    XNonce::from_slice(&out.as_bytes()[..24]).to_owned()
}

impl CipherKey {
    pub fn new(key: [u8; KEY_LEN], salt: [u8; 32]) -> Self {
        Self { key, salt }
    }

    /// XOR the chunk's keystream into `buf`. Sealing and opening are the same
    /// operation.
    pub fn apply_keystream(&self, chunk_index: u64, buf: &mut [u8]) {
        let nonce = derive_nonce(&self.salt, chunk_index);
        let mut cipher = XChaCha20::new(Key::from_slice(&self.key), &nonce);
        cipher.apply_keystream(buf);
    }
}
