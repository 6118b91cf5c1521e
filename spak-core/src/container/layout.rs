use crate::error::{Result, SpakError};

/// Chunk arithmetic over an archive laid out as repeated
/// `[signature: S][data: C]` records, the final data segment possibly short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    raw_size: u64,
    chunk_data_size: u64,
    signature_size: u64,
    chunk_count: u64,
    logical_size: u64,
}

impl ChunkLayout {
    pub fn new(raw_size: u64, chunk_data_size: u64, signature_size: u64) -> Result<Self> {
        if chunk_data_size == 0 {
            return Err(SpakError::Format("chunk data size must be non-zero".into()));
        }
        let stride = chunk_data_size
            .checked_add(signature_size)
            .ok_or_else(|| SpakError::Format("chunk stride overflow".into()))?;
        let full = raw_size / stride;
        let rem = raw_size % stride;
        let (chunk_count, logical_size) = if rem == 0 {
            (full, full * chunk_data_size)
        } else if rem > signature_size {
            (full + 1, full * chunk_data_size + (rem - signature_size))
        } else {
            return Err(SpakError::Format(format!(
                "trailing {rem} bytes cannot hold a {signature_size}-byte signature and data"
            )));
        };
        Ok(Self {
            raw_size,
            chunk_data_size,
            signature_size,
            chunk_count,
            logical_size,
        })
    }

    #[inline]
    pub fn raw_size(&self) -> u64 {
        self.raw_size
    }

    #[inline]
    pub fn chunk_data_size(&self) -> u64 {
        self.chunk_data_size
    }

    #[inline]
    pub fn signature_size(&self) -> u64 {
        self.signature_size
    }

    #[inline]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Size of the archive with signatures stripped.
    #[inline]
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    #[inline]
    pub fn stride(&self) -> u64 {
        self.chunk_data_size + self.signature_size
    }

    /// Chunk holding logical offset `pos`.
    #[inline]
    pub fn chunk_index(&self, pos: u64) -> u64 {
        pos / self.chunk_data_size
    }

    /// Logical offset of the first byte of chunk `index`.
    #[inline]
    pub fn chunk_start(&self, index: u64) -> u64 {
        index * self.chunk_data_size
    }

    /// On-disk offset of chunk `index` (its signature comes first).
    #[inline]
    pub fn raw_offset(&self, index: u64) -> u64 {
        index * self.stride()
    }

    #[inline]
    pub fn raw_chunk_index(&self, raw_pos: u64) -> u64 {
        raw_pos / self.stride()
    }

    /// On-disk offset of the data byte at logical offset `pos`.
    pub fn raw_data_offset(&self, pos: u64) -> u64 {
        let index = self.chunk_index(pos);
        self.raw_offset(index) + self.signature_size + (pos - self.chunk_start(index))
    }

    /// Logical bytes in chunk `index`; only the last chunk may be short.
    pub fn chunk_size(&self, index: u64) -> u64 {
        if index + 1 < self.chunk_count {
            self.chunk_data_size
        } else if index + 1 == self.chunk_count {
            self.logical_size - self.chunk_start(index)
        } else {
            0
        }
    }
}
