use crate::cache::request::ChunkHandle;
use crate::cache::worker::ChunkCacheWorker;
use crate::container::layout::ChunkLayout;
use crate::error::{Result, SpakError};
use crate::source::ByteSource;
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, trace};

/// Reader-owned copy of the chunk a previous read stopped inside.
struct LastChunk {
    index: u64,
    data: Vec<u8>,
}

enum Origin {
    Last,
    Handle(ChunkHandle),
}

/// One chunk's contribution to a read.
struct ReadInfo {
    origin: Origin,
    /// Offset inside the chunk's logical bytes.
    src_off: u64,
    /// Offset inside the caller's buffer.
    dst_off: usize,
    len: usize,
    /// Read ends inside this chunk; keep a copy for the next call.
    retain: bool,
}

/// Sequential, seekable view of the logical (signature-free) bytes of a
/// signed archive. Every byte handed out has been verified by the shared
/// [`ChunkCacheWorker`].
///
/// A reader is single-threaded; open one per thread over the same worker.
/// Long reads are split into windows of [`ChunkCacheWorker::max_in_flight`]
/// chunks so a reader never pins more buffers than the pool can spare.
pub struct SignedArchiveReader {
    worker: Arc<ChunkCacheWorker>,
    layout: ChunkLayout,
    pos: u64,
    last: Option<LastChunk>,
    ahead: VecDeque<ChunkHandle>,
}

impl SignedArchiveReader {
    pub fn new(source: &dyn ByteSource, worker: Arc<ChunkCacheWorker>) -> Result<Self> {
        let layout = worker.layout_for(source)?;
        Ok(Self::with_layout(worker, layout))
    }

    pub(crate) fn with_layout(worker: Arc<ChunkCacheWorker>, layout: ChunkLayout) -> Self {
        Self {
            worker,
            layout,
            pos: 0,
            last: None,
            ahead: VecDeque::new(),
        }
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn total_size(&self) -> u64 {
        self.layout.logical_size()
    }

    /// Move to logical offset `pos`. Positions past the end are accepted;
    /// the next non-empty read there fails.
    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Fill `dest` from the current position and advance past it. On error
    /// the position is unchanged and `dest` may be partly written, but never
    /// with bytes from a chunk that failed verification.
    pub fn read_into(&mut self, dest: &mut [u8]) -> Result<()> {
        if dest.is_empty() {
            return Ok(());
        }
        let size = self.layout.logical_size();
        let len = dest.len() as u64;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= size)
            .ok_or(SpakError::OutOfBounds {
                pos: self.pos,
                len,
                size,
            })?;

        let first = self.layout.chunk_index(self.pos);
        let last = self.layout.chunk_index(end - 1);
        let window = self.worker.max_in_flight().max(1) as u64;
        trace!(pos = self.pos, len, first, last, "signed read");

        let mut start = first;
        while start <= last {
            let stop = last.min(start + window - 1);
            let reads = self.plan(start, stop, last, end)?;
            if stop == last {
                self.precache(last);
            }
            // Handles drop as each chunk is copied, freeing slots for the
            // rest of the window.
            for read in reads {
                self.copy(read, dest)?;
            }
            start = stop + 1;
        }

        self.pos = end;
        Ok(())
    }

    fn plan(&mut self, start: u64, stop: u64, last: u64, end: u64) -> Result<Vec<ReadInfo>> {
        let mut reads = Vec::with_capacity((stop - start + 1) as usize);
        for index in start..=stop {
            let chunk_start = self.layout.chunk_start(index);
            let chunk_end = chunk_start + self.layout.chunk_size(index);
            let from = self.pos.max(chunk_start);
            let to = end.min(chunk_end);

            let origin = if self.last.as_ref().is_some_and(|l| l.index == index) {
                Origin::Last
            } else {
                Origin::Handle(self.handle_for(index)?)
            };
            reads.push(ReadInfo {
                origin,
                src_off: from - chunk_start,
                dst_off: (from - self.pos) as usize,
                len: (to - from) as usize,
                retain: index == last && to < chunk_end,
            });
        }
        Ok(reads)
    }

    fn handle_for(&mut self, index: u64) -> Result<ChunkHandle> {
        if let Some(at) = self.ahead.iter().position(|h| h.index() == index) {
            if let Some(handle) = self.ahead.remove(at) {
                return Ok(handle);
            }
        }
        self.worker.request_chunk(
            index,
            self.layout.raw_offset(index),
            self.layout.chunk_size(index),
        )
    }

    /// Hold handles for the chunks after `last` so they load while the
    /// caller works on this read. Failures here only cost the hint.
    fn precache(&mut self, last: u64) {
        let n = self.worker.precache_chunks() as u64;
        if n == 0 {
            return;
        }
        let lo = last + 1;
        let hi = (last + n).min(self.layout.chunk_count().saturating_sub(1));
        self.ahead.retain(|h| (lo..=hi).contains(&h.index()));
        for index in lo..=hi {
            if self.ahead.iter().any(|h| h.index() == index) {
                continue;
            }
            let requested = self.worker.request_chunk(
                index,
                self.layout.raw_offset(index),
                self.layout.chunk_size(index),
            );
            match requested {
                Ok(handle) => self.ahead.push_back(handle),
                Err(e) => {
                    debug!(chunk = index, error = %e, "precache request dropped");
                    return;
                }
            }
        }
    }

    fn copy(&mut self, read: ReadInfo, dest: &mut [u8]) -> Result<()> {
        let out = &mut dest[read.dst_off..read.dst_off + read.len];
        match read.origin {
            Origin::Last => {
                let Some(last) = self.last.as_ref() else {
                    return Err(SpakError::Format("retained chunk vanished".into()));
                };
                let src = read.src_off as usize;
                out.copy_from_slice(&last.data[src..src + read.len]);
            }
            Origin::Handle(handle) => {
                handle.copy_to(read.src_off, out)?;
                if read.retain {
                    self.retain(&handle)?;
                }
            }
        }
        Ok(())
    }

    fn retain(&mut self, handle: &ChunkHandle) -> Result<()> {
        let mut data = self.last.take().map(|l| l.data).unwrap_or_default();
        data.resize(handle.size() as usize, 0);
        handle.copy_to(0, &mut data)?;
        self.last = Some(LastChunk {
            index: handle.index(),
            data,
        });
        Ok(())
    }
}

impl Read for SignedArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.total_size().saturating_sub(self.pos);
        let n = remaining.min(buf.len() as u64) as usize;
        self.read_into(&mut buf[..n])?;
        Ok(n)
    }
}

impl Seek for SignedArchiveReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.total_size().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.pos = target;
        Ok(target)
    }
}

impl std::fmt::Debug for SignedArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedArchiveReader")
            .field("pos", &self.pos)
            .field("size", &self.layout.logical_size())
            .field("last", &self.last.as_ref().map(|l| l.index))
            .field("ahead", &self.ahead.len())
            .finish()
    }
}
