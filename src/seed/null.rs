use async_trait::async_trait;
use log::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::chunk::NullChunk;
use crate::error::Error;
use crate::index::IndexChunk;
use crate::reflink::clone_file_range;
use crate::seed::{Seed, SeedMatch, SegmentWriter, WriteSummary};

/// Seed matching runs of chunks whose ID is the precomputed null-chunk ID.
pub struct NullChunkSeed {
    null: Arc<NullChunk>,
    /// Directory of the output file; a clone source must live on the same
    /// filesystem.
    dst_dir: PathBuf,
}

impl NullChunkSeed {
    pub fn new(null: Arc<NullChunk>, dst_dir: impl Into<PathBuf>) -> Self {
        Self {
            null,
            dst_dir: dst_dir.into(),
        }
    }
}

#[async_trait]
impl Seed for NullChunkSeed {
    fn longest_match(&self, tail: &[IndexChunk]) -> Option<SeedMatch> {
        let n = tail
            .iter()
            .take_while(|chunk| chunk.id == self.null.id)
            .count();
        if n == 0 {
            return None;
        }
        let bytes = n as u64 * self.null.size();
        Some(SeedMatch {
            chunks: n,
            bytes,
            writer: Box::new(NullSegment {
                bytes,
                dst_dir: self.dst_dir.clone(),
            }),
        })
    }

    async fn regenerate_index(&self, _n: usize, _cancel: &CancellationToken) -> Result<(), Error> {
        Ok(())
    }

    fn mark_invalid(&self) {}

    fn is_invalid(&self) -> bool {
        false
    }

    fn validation_path(&self) -> Option<&Path> {
        None
    }
}

struct NullSegment {
    bytes: u64,
    dst_dir: PathBuf,
}

impl NullSegment {
    /// Clone zeros block by block out of a one-blocksize source file.
    /// Returns `None` when cloning is unavailable.
    async fn clone_zeros(
        &self,
        dst: &mut File,
        offset: u64,
        length: u64,
        blocksize: u64,
    ) -> Result<Option<WriteSummary>, Error> {
        let head = (blocksize - offset % blocksize) % blocksize;
        if length <= head {
            return Ok(None);
        }
        let aligned = (length - head) / blocksize * blocksize;
        if aligned == 0 {
            return Ok(None);
        }
        let zero_file = match tempfile::Builder::new()
            .prefix(".castr-zero-")
            .tempfile_in(&self.dst_dir)
        {
            Ok(file) => file,
            Err(err) => {
                debug!("no zero clone source: {}", err);
                return Ok(None);
            }
        };
        zero_file.as_file().set_len(blocksize)?;
        let src = File::open(zero_file.path()).await?;
        dst.flush().await?;
        let mut cloned = 0;
        while cloned < aligned {
            if !clone_file_range(&src, 0, dst, offset + head + cloned, blocksize) {
                return Ok(None);
            }
            cloned += blocksize;
        }
        // Byte-write the unaligned fringes.
        write_zeros(dst, offset, head).await?;
        let tail = length - head - aligned;
        write_zeros(dst, offset + head + aligned, tail).await?;
        Ok(Some(WriteSummary {
            copied: head + tail,
            cloned: aligned,
        }))
    }
}

#[async_trait]
impl SegmentWriter for NullSegment {
    fn size(&self) -> u64 {
        self.bytes
    }

    async fn write_into(
        &self,
        dst: &mut File,
        offset: u64,
        length: u64,
        blocksize: u64,
        is_blank: bool,
    ) -> Result<WriteSummary, Error> {
        // A freshly truncated destination already reads as zeros.
        if is_blank {
            return Ok(WriteSummary::default());
        }
        if blocksize > 0 {
            if let Some(summary) = self.clone_zeros(dst, offset, length, blocksize).await? {
                return Ok(summary);
            }
        }
        write_zeros(dst, offset, length).await?;
        Ok(WriteSummary {
            copied: length,
            cloned: 0,
        })
    }

    async fn validate(&self, _src: &mut File) -> Result<(), Error> {
        Ok(())
    }
}

async fn write_zeros(dst: &mut File, offset: u64, length: u64) -> Result<(), Error> {
    if length == 0 {
        return Ok(());
    }
    let buf = vec![0u8; 64 * 1024];
    dst.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut left = length;
    while left > 0 {
        let n = std::cmp::min(left, buf.len() as u64) as usize;
        dst.write_all(&buf[..n]).await?;
        left -= n as u64;
    }
    Ok(())
}
