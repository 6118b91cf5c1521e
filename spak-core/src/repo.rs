use crate::cache::worker::ChunkCacheWorker;
use crate::config::CacheConfig;
use crate::container::layout::ChunkLayout;
use crate::crypto::ChunkCrypto;
use crate::crypto::cipher::CipherKey;
use crate::crypto::sign::ArchiveKey;
use crate::error::{Result, SpakError};
use crate::read::signed::SignedArchiveReader;
use crate::source::{ByteSource, FileSource};
use crate::stats::Stats;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct OpenParams {
    pub archive_path: PathBuf,
    pub public_key: [u8; 32],
    pub cipher_key: Option<[u8; 32]>,
    pub key_salt: [u8; 32],
    pub cache: CacheConfig,
}

impl OpenParams {
    pub fn archive_key(&self) -> Result<ArchiveKey> {
        let key = ArchiveKey::new(&self.public_key)?;
        Ok(match self.cipher_key {
            Some(k) => key.with_cipher(CipherKey::new(k, self.key_salt)),
            None => key,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub chunks: u64,
    pub bytes: u64,
}

/// One opened archive: its source, its layout and the single worker that
/// verifies it. Hand out as many readers as needed.
pub struct SignedArchive {
    source: Arc<dyn ByteSource>,
    worker: Arc<ChunkCacheWorker>,
    layout: ChunkLayout,
}

impl SignedArchive {
    pub fn open(params: &OpenParams) -> Result<Self> {
        let source = FileSource::open(&params.archive_path)?;
        let key = params.archive_key()?;
        debug!(
            path = %params.archive_path.display(),
            encrypted = key.is_encrypted(),
            "opening signed archive"
        );
        Self::from_source(Arc::new(source), Arc::new(key), &params.cache)
    }

    pub fn from_source(
        source: Arc<dyn ByteSource>,
        crypto: Arc<dyn ChunkCrypto>,
        config: &CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        // Reject a malformed layout before a worker thread exists.
        let layout = ChunkLayout::new(
            source.total_size(),
            config.chunk_data_size,
            crypto.signature_len() as u64,
        )?;
        let worker = Arc::new(ChunkCacheWorker::new(source.clone(), crypto, config)?);
        Ok(Self {
            source,
            worker,
            layout,
        })
    }

    pub fn reader(&self) -> SignedArchiveReader {
        SignedArchiveReader::with_layout(self.worker.clone(), self.layout)
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn total_size(&self) -> u64 {
        self.layout.logical_size()
    }

    pub fn worker(&self) -> &Arc<ChunkCacheWorker> {
        &self.worker
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    pub fn stats(&self) -> Stats {
        self.worker.stats()
    }

    /// Verified copy of `len` logical bytes starting at `start`.
    pub fn read_range(&self, start: u64, len: u64) -> Result<Vec<u8>> {
        let size = self.total_size();
        let out_of_bounds = SpakError::OutOfBounds {
            pos: start,
            len,
            size,
        };
        if start.checked_add(len).is_none_or(|end| end > size) {
            return Err(out_of_bounds);
        }
        let len = usize::try_from(len).map_err(|_| out_of_bounds)?;
        let mut reader = self.reader();
        reader.seek_to(start);
        let mut out = vec![0u8; len];
        reader.read_into(&mut out)?;
        Ok(out)
    }

    /// Read every chunk once, stopping at the first one that fails.
    pub fn verify_all(&self) -> Result<VerifyReport> {
        let mut reader = self.reader();
        let mut buf = vec![0u8; self.layout.chunk_data_size() as usize];
        let mut report = VerifyReport::default();
        for index in 0..self.layout.chunk_count() {
            let n = self.layout.chunk_size(index) as usize;
            reader.read_into(&mut buf[..n])?;
            report.chunks += 1;
            report.bytes += n as u64;
        }
        Ok(report)
    }

    /// Stop the worker. Readers still holding the archive fail with
    /// `Stopped` on their next uncached chunk.
    pub fn close(&self) {
        self.worker.stop();
    }
}

impl std::fmt::Debug for SignedArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedArchive")
            .field("layout", &self.layout)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::testutil::*;
    use std::io::Write;

    const C: u64 = 100;

    fn write_archive(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn params(path: PathBuf) -> OpenParams {
        OpenParams {
            archive_path: path,
            public_key: signing_key().verifying_key().to_bytes(),
            cipher_key: None,
            key_salt: [0u8; 32],
            cache: small_config(C, 4),
        }
    }

    #[test]
    fn opens_file_and_verifies_every_chunk() {
        let plain = pattern(470);
        let file = write_archive(&seal(&plain, C as usize, None));
        let archive = SignedArchive::open(&params(file.path().to_path_buf())).unwrap();

        assert_eq!(archive.total_size(), 470);
        assert_eq!(archive.layout().chunk_count(), 5);
        let report = archive.verify_all().unwrap();
        assert_eq!(
            report,
            VerifyReport {
                chunks: 5,
                bytes: 470
            }
        );
        assert_eq!(archive.read_range(333, 100).unwrap(), plain[333..433]);
        assert_eq!(archive.stats().verified, 5);
    }

    #[test]
    fn encrypted_file_round_trips() {
        let plain = pattern(250);
        let key = [5u8; 32];
        let salt = [6u8; 32];
        let sealed = seal(&plain, C as usize, Some(&CipherKey::new(key, salt)));
        let file = write_archive(&sealed);
        let mut p = params(file.path().to_path_buf());
        p.cipher_key = Some(key);
        p.key_salt = salt;

        let archive = SignedArchive::open(&p).unwrap();
        assert_eq!(archive.read_range(0, 250).unwrap(), plain);

        // Wrong salt decrypts to garbage but still verifies.
        p.key_salt = [7u8; 32];
        let wrong = SignedArchive::open(&p).unwrap();
        assert_ne!(wrong.read_range(0, 250).unwrap(), plain);
    }

    #[test]
    fn verify_all_stops_at_tampered_chunk() {
        let plain = pattern(400);
        let mut sealed = seal(&plain, C as usize, None);
        sealed[3 * 164 + 10] ^= 1;
        let file = write_archive(&sealed);
        let archive = SignedArchive::open(&params(file.path().to_path_buf())).unwrap();

        let err = archive.verify_all().unwrap_err();
        assert!(err.is_tampered());
        assert!(matches!(err, SpakError::Tampered { chunk: 3 }));
    }

    #[test]
    fn tampered_chunk_shuts_down_the_whole_archive() {
        let plain = pattern(300);
        let mut sealed = seal(&plain, C as usize, None);
        sealed[164 + 64 + 5] ^= 0x10;
        let archive = SignedArchive::from_source(
            Arc::new(MemorySource::new(sealed)),
            Arc::new(archive_key()),
            &small_config(C, 4),
        )
        .unwrap();

        assert!(matches!(
            archive.read_range(100, 10),
            Err(SpakError::Tampered { chunk: 1 })
        ));
        // chunk 2 is intact, but the archive is no longer trusted
        assert!(matches!(
            archive.read_range(200, 10),
            Err(SpakError::Tampered { chunk: 1 })
        ));
        assert!(archive.verify_all().unwrap_err().is_tampered());
        assert_eq!(archive.stats().verified, 0);
    }

    #[test]
    fn wrong_public_key_rejects_first_chunk() {
        let plain = pattern(200);
        let source = Arc::new(MemorySource::new(seal(&plain, C as usize, None)));
        let other = ed25519_dalek::SigningKey::from_bytes(&[8u8; 32]);
        let key = ArchiveKey::new(other.verifying_key().as_bytes()).unwrap();
        let archive = SignedArchive::from_source(source, Arc::new(key), &small_config(C, 4)).unwrap();

        let err = archive.read_range(0, 10).unwrap_err();
        assert!(matches!(err, SpakError::Tampered { chunk: 0 }));
    }

    #[test]
    fn malformed_layout_is_a_format_error() {
        let plain = pattern(200);
        let mut sealed = seal(&plain, C as usize, None);
        sealed.extend_from_slice(&[0u8; 40]);
        let source = Arc::new(MemorySource::new(sealed));
        let err = SignedArchive::from_source(source, Arc::new(archive_key()), &small_config(C, 4))
            .unwrap_err();
        assert!(matches!(err, SpakError::Format(_)));
    }

    #[test]
    fn closed_archive_refuses_new_chunks() {
        let plain = pattern(300);
        let archive =
            SignedArchive::from_source(sealed_source(&plain, C as usize), Arc::new(archive_key()), &small_config(C, 4))
                .unwrap();
        archive.close();
        assert!(archive.worker().is_stopped());
        assert!(matches!(archive.read_range(0, 10), Err(SpakError::Stopped)));
    }

    #[test]
    fn oversized_range_is_out_of_bounds() {
        let plain = pattern(300);
        let archive =
            SignedArchive::from_source(sealed_source(&plain, C as usize), Arc::new(archive_key()), &small_config(C, 4))
                .unwrap();

        assert!(matches!(
            archive.read_range(10, u64::MAX),
            Err(SpakError::OutOfBounds {
                pos: 10,
                len: u64::MAX,
                size: 300
            })
        ));
        assert!(matches!(
            archive.read_range(250, 51),
            Err(SpakError::OutOfBounds { .. })
        ));
        assert_eq!(archive.read_range(250, 50).unwrap(), plain[250..]);
        assert_eq!(archive.stats().requests, 1);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SignedArchive::open(&params(dir.path().join("absent.spak"))).unwrap_err();
        assert!(matches!(err, SpakError::Io(_)));
    }
}
