//! Seeds: pre-existing local sources of bytes consulted during extraction
//! before falling back to a chunk store.

use async_trait::async_trait;
use std::cmp;
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::index::IndexChunk;

mod file;
mod null;
mod self_seed;

pub use file::FileSeed;
pub use null::NullChunkSeed;
pub use self_seed::SelfSeed;

/// What to do when a seed no longer matches its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSeedAction {
    /// Fail the extract.
    BailOut,
    /// Drop the seed and re-plan; its segments fall through to other seeds
    /// or the store.
    Skip,
    /// Re-chunk the seed blob, refresh its index and re-plan.
    RegenerateIndex,
}

/// Byte counts produced by a segment write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub copied: u64,
    pub cloned: u64,
}

/// Longest run a seed can provide at the current sequencer position.
pub struct SeedMatch {
    /// Number of index chunks covered.
    pub chunks: usize,
    /// Byte size of the run.
    pub bytes: u64,
    pub writer: Box<dyn SegmentWriter>,
}

#[async_trait]
pub trait Seed: Send + Sync {
    /// Longest prefix of `tail` this seed can materialise contiguously,
    /// together with a writer for it. `None` when the first chunk is not
    /// available or the seed is invalid.
    fn longest_match(&self, tail: &[IndexChunk]) -> Option<SeedMatch>;

    /// Re-chunk the backing blob and refresh the position table, clearing
    /// the invalid flag. Best effort: a blob that keeps changing can be
    /// stale again by the time the new index is used; the extractor's
    /// post-write verification remains the final guard.
    async fn regenerate_index(&self, n: usize, cancel: &CancellationToken) -> Result<(), Error>;

    fn mark_invalid(&self);
    fn is_invalid(&self) -> bool;

    /// Path of the backing blob for seeds subject to plan validation;
    /// `None` for seeds whose bytes cannot go stale.
    fn validation_path(&self) -> Option<&Path>;
}

/// Materialises one segment of the plan into the output file.
#[async_trait]
pub trait SegmentWriter: Send + Sync {
    /// Number of bytes the writer produces.
    fn size(&self) -> u64;

    /// Write `length` bytes at `offset` of `dst`, cloning blocks where the
    /// alignment works out and byte-copying the rest. `is_blank` marks a
    /// freshly truncated destination whose bytes read as zero.
    async fn write_into(
        &self,
        dst: &mut File,
        offset: u64,
        length: u64,
        blocksize: u64,
        is_blank: bool,
    ) -> Result<WriteSummary, Error>;

    /// Rehash the segment's source bytes against their chunk IDs, reading
    /// through `src`.
    async fn validate(&self, src: &mut File) -> Result<(), Error>;
}

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Byte copy between two files with a reusable buffer.
pub(crate) async fn copy_range(
    src: &mut File,
    src_offset: u64,
    dst: &mut File,
    dst_offset: u64,
    length: u64,
) -> Result<(), Error> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    src.seek(SeekFrom::Start(src_offset)).await?;
    dst.seek(SeekFrom::Start(dst_offset)).await?;
    let mut left = length;
    while left > 0 {
        let n = cmp::min(left, COPY_BUF_SIZE as u64) as usize;
        src.read_exact(&mut buf[..n]).await?;
        dst.write_all(&buf[..n]).await?;
        left -= n as u64;
    }
    Ok(())
}
