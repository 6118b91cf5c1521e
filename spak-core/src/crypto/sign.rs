use super::ChunkCrypto;
use super::cipher::CipherKey;
use crate::error::{Result, SpakError};
use blake3::Hasher;
use ed25519_dalek::{Signature, VerifyingKey};

pub const SIGNATURE_LEN: usize = ed25519_dalek::SIGNATURE_LENGTH;
pub const PUBLIC_KEY_LEN: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

const DIGEST_DOMAIN: &[u8] = b"spak/chunk-signature/v1";

/// Message signed for each chunk: blake3(domain || index || stored data).
/// Binding the index means a validly signed chunk moved to another position
/// still fails verification.
pub fn chunk_digest(chunk_index: u64, data: &[u8]) -> [u8; 32] {
    let mut h = Hasher::new();
    h.update(DIGEST_DOMAIN);
    h.update(&chunk_index.to_le_bytes());
    h.update(data);
    *h.finalize().as_bytes()
}

/// Verification key for one archive, optionally paired with the key that
/// decrypts its chunks.
#[derive(Clone)]
pub struct ArchiveKey {
    verifying: VerifyingKey,
    cipher: Option<CipherKey>,
}

impl std::fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveKey")
            .field("verifying", &self.verifying)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl ArchiveKey {
    pub fn new(public_key: &[u8; PUBLIC_KEY_LEN]) -> Result<Self> {
        let verifying = VerifyingKey::from_bytes(public_key)
            .map_err(|e| SpakError::Key(format!("invalid public key: {e}")))?;
        Ok(Self {
            verifying,
            cipher: None,
        })
    }

    pub fn with_cipher(mut self, cipher: CipherKey) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }
}

impl ChunkCrypto for ArchiveKey {
    fn signature_len(&self) -> usize {
        SIGNATURE_LEN
    }

    fn verify(&self, index: u64, data: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying
            .verify_strict(&chunk_digest(index, data), &sig)
            .is_ok()
    }

    fn decrypt(&self, index: u64, data: &[u8], out: &mut [u8]) {
        out.copy_from_slice(data);
        if let Some(cipher) = &self.cipher {
            cipher.apply_keystream(index, out);
        }
    }
}
