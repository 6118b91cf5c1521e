use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

/// Random-access, read-only view of the raw signed archive bytes.
pub trait ByteSource: Send + Sync {
    fn total_size(&self) -> u64;

    /// Fill `buf` from `offset`. Anything short of `buf.len()` bytes is an
    /// `UnexpectedEof` error.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

pub struct FileSource {
    f: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Self::from_file(File::open(path)?)
    }

    pub fn from_file(f: File) -> std::io::Result<Self> {
        let len = f.metadata()?.len();
        Ok(Self {
            f: Mutex::new(f),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn total_size(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let mut f = self
            .f
            .lock()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)
    }
}

/// Archive bytes already resident in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl ByteSource for MemorySource {
    fn total_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.bytes.get(start..end))
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "read of {} bytes at {} past end of source ({} bytes)",
                        buf.len(),
                        offset,
                        self.bytes.len()
                    ),
                )
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}
