use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::Error;
use crate::rolling_hash::{discriminator_from_avg, RollingHash, WINDOW_SIZE};

pub const CHUNK_SIZE_MIN_DEFAULT: u64 = 16 * 1024;
pub const CHUNK_SIZE_AVG_DEFAULT: u64 = 64 * 1024;
pub const CHUNK_SIZE_MAX_DEFAULT: u64 = 256 * 1024;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Chunk size limits for the content-defined chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub min_size: u64,
    pub avg_size: u64,
    pub max_size: u64,
}

impl ChunkerConfig {
    pub fn new(min_size: u64, avg_size: u64, max_size: u64) -> Result<Self, Error> {
        if min_size < WINDOW_SIZE as u64 {
            return Err(Error::ConfigInvalid("min chunk size below the hash window"));
        }
        if min_size > avg_size || avg_size > max_size {
            return Err(Error::ConfigInvalid(
                "chunk sizes must satisfy min <= avg <= max",
            ));
        }
        Ok(Self {
            min_size,
            avg_size,
            max_size,
        })
    }

    /// Derive min/max from an average size the same way casync does
    /// (`avg / 4` and `avg * 4`).
    pub fn from_avg(avg_size: u64) -> Result<Self, Error> {
        Self::new(avg_size / 4, avg_size, avg_size * 4)
    }

    pub fn discriminator(&self) -> u32 {
        discriminator_from_avg(self.avg_size)
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: CHUNK_SIZE_MIN_DEFAULT,
            avg_size: CHUNK_SIZE_AVG_DEFAULT,
            max_size: CHUNK_SIZE_MAX_DEFAULT,
        }
    }
}

/// Content-defined chunker over a byte stream.
///
/// Produces `(start, bytes)` pairs where `start` is the absolute offset of
/// the chunk. A cut happens at `max`, at a rolling hash boundary past
/// `min`, or at end of input. The rolling hash is primed with the bytes in
/// `[min - 48, min)` so the window is full when the predicate is first
/// checked, and reset at every cut.
pub struct Chunker<'a, R> {
    config: ChunkerConfig,
    hash: RollingHash,
    reader: &'a mut R,
    pending: BytesMut,
    scanned: usize,
    offset: u64,
    eof: bool,
}

impl<'a, R> Chunker<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(config: &ChunkerConfig, reader: &'a mut R) -> Self {
        Self::with_offset(config, reader, 0)
    }

    /// Chunker over a reader already positioned at absolute offset
    /// `offset`; emitted chunk starts are absolute.
    pub fn with_offset(config: &ChunkerConfig, reader: &'a mut R, offset: u64) -> Self {
        Self {
            config: *config,
            hash: RollingHash::new(config.discriminator()),
            reader,
            pending: BytesMut::new(),
            scanned: 0,
            offset,
            eof: false,
        }
    }

    /// Next chunk, or `None` at end of input.
    pub async fn next_chunk(&mut self) -> Result<Option<(u64, Bytes)>, Error> {
        loop {
            if self.scanned < self.pending.len() {
                if let Some(cut) = self.scan_pending() {
                    return Ok(Some(self.emit(cut)));
                }
            }
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let len = self.pending.len();
                return Ok(Some(self.emit(len)));
            }
            self.pending.reserve(READ_BUF_SIZE);
            if self.reader.read_buf(&mut self.pending).await? == 0 {
                self.eof = true;
            }
        }
    }

    /// Scan unexamined pending bytes; returns the chunk length on a cut.
    fn scan_pending(&mut self) -> Option<usize> {
        let min = self.config.min_size as usize;
        let max = self.config.max_size as usize;
        let mut pos = self.scanned;
        // Bytes before the priming window are not fed to the hash.
        let skip_until = min - WINDOW_SIZE;
        if pos < skip_until {
            pos = skip_until.min(self.pending.len());
        }
        while pos < self.pending.len() {
            let byte = self.pending[pos];
            self.hash.roll(byte);
            pos += 1;
            if pos >= min && (pos >= max || self.hash.at_boundary()) {
                self.scanned = pos;
                return Some(pos);
            }
        }
        self.scanned = pos;
        None
    }

    fn emit(&mut self, len: usize) -> (u64, Bytes) {
        let chunk = self.pending.split_to(len).freeze();
        self.scanned = 0;
        self.hash.reset();
        let start = self.offset;
        self.offset += len as u64;
        (start, chunk)
    }
}

impl<'a, R> Chunker<'a, R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Skip `count` input bytes from the current chunk start without
    /// scanning them. Buffered bytes are discarded and the reader is
    /// repositioned; the rolling state starts fresh.
    pub async fn advance(&mut self, count: u64) -> Result<(), Error> {
        self.offset += count;
        self.pending.clear();
        self.scanned = 0;
        self.hash.reset();
        self.eof = false;
        self.reader.seek(SeekFrom::Start(self.offset)).await?;
        Ok(())
    }
}
