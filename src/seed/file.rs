use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::hash::ChunkId;
use crate::index::{Index, IndexChunk};
use crate::parallel_chunker::index_from_path;
use crate::reflink::clone_file_range;
use crate::seed::{copy_range, Seed, SeedMatch, SegmentWriter, WriteSummary};

/// Seed backed by a local blob and its index.
pub struct FileSeed {
    path: PathBuf,
    index: RwLock<Index>,
    positions: RwLock<HashMap<ChunkId, Vec<usize>>>,
    invalid: AtomicBool,
}

impl FileSeed {
    pub fn new(path: impl Into<PathBuf>, index: Index) -> Self {
        let positions = build_positions(&index);
        Self {
            path: path.into(),
            index: RwLock::new(index),
            positions: RwLock::new(positions),
            invalid: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn build_positions(index: &Index) -> HashMap<ChunkId, Vec<usize>> {
    let mut positions: HashMap<ChunkId, Vec<usize>> = HashMap::new();
    for (i, chunk) in index.chunks.iter().enumerate() {
        positions.entry(chunk.id).or_default().push(i);
    }
    positions
}

#[async_trait]
impl Seed for FileSeed {
    fn longest_match(&self, tail: &[IndexChunk]) -> Option<SeedMatch> {
        if self.is_invalid() || tail.is_empty() {
            return None;
        }
        let index = self.index.read().unwrap();
        let positions = self.positions.read().unwrap();
        let candidates = positions.get(&tail[0].id)?;
        let mut best = 0;
        let mut best_at = 0;
        for &j in candidates {
            let mut n = 0;
            while j + n < index.chunks.len()
                && n < tail.len()
                && index.chunks[j + n].id == tail[n].id
            {
                n += 1;
            }
            if n > best {
                best = n;
                best_at = j;
            }
        }
        if best == 0 {
            return None;
        }
        let chunks = index.chunks[best_at..best_at + best].to_vec();
        let bytes = chunks.iter().map(|c| c.size).sum();
        Some(SeedMatch {
            chunks: best,
            bytes,
            writer: Box::new(FileSeedSegment::new(self.path.clone(), chunks)),
        })
    }

    async fn regenerate_index(&self, n: usize, cancel: &CancellationToken) -> Result<(), Error> {
        let config = self.index.read().unwrap().config;
        let fresh = index_from_path(&self.path, &config, n, cancel).await?;
        *self.positions.write().unwrap() = build_positions(&fresh);
        *self.index.write().unwrap() = fresh;
        self.invalid.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::Relaxed);
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    fn validation_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Writer for a contiguous run of chunks out of a seed blob. Also used by
/// the self seed, whose source blob is the output file itself.
pub(crate) struct FileSeedSegment {
    path: PathBuf,
    chunks: Vec<IndexChunk>,
}

impl FileSeedSegment {
    pub(crate) fn new(path: PathBuf, chunks: Vec<IndexChunk>) -> Self {
        Self { path, chunks }
    }

    fn source_offset(&self) -> u64 {
        self.chunks.first().map(|c| c.start).unwrap_or(0)
    }
}

#[async_trait]
impl SegmentWriter for FileSeedSegment {
    fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    async fn write_into(
        &self,
        dst: &mut File,
        offset: u64,
        length: u64,
        blocksize: u64,
        _is_blank: bool,
    ) -> Result<WriteSummary, Error> {
        let mut src = File::open(&self.path).await?;
        let src_offset = self.source_offset();
        // Clone the aligned inner region when source and destination agree
        // on their position within a block.
        if blocksize > 0 && src_offset % blocksize == offset % blocksize {
            let head = (blocksize - offset % blocksize) % blocksize;
            if length > head {
                let aligned = (length - head) / blocksize * blocksize;
                if aligned > 0 {
                    dst.flush().await?;
                    if clone_file_range(&src, src_offset + head, dst, offset + head, aligned) {
                        if head > 0 {
                            copy_range(&mut src, src_offset, dst, offset, head).await?;
                        }
                        let tail = length - head - aligned;
                        if tail > 0 {
                            copy_range(
                                &mut src,
                                src_offset + head + aligned,
                                dst,
                                offset + head + aligned,
                                tail,
                            )
                            .await?;
                        }
                        return Ok(WriteSummary {
                            copied: length - aligned,
                            cloned: aligned,
                        });
                    }
                }
            }
        }
        copy_range(&mut src, src_offset, dst, offset, length).await?;
        Ok(WriteSummary {
            copied: length,
            cloned: 0,
        })
    }

    async fn validate(&self, src: &mut File) -> Result<(), Error> {
        src.seek(SeekFrom::Start(self.source_offset())).await?;
        let mut buf = Vec::new();
        for chunk in &self.chunks {
            buf.resize(chunk.size as usize, 0);
            src.read_exact(&mut buf).await?;
            let got = ChunkId::digest(&buf);
            if got != chunk.id {
                return Err(Error::SeedInvalid(self.path.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::hash::HashFunction;

    fn index_of(ids: &[ChunkId], size: u64) -> Index {
        let chunks = ids
            .iter()
            .enumerate()
            .map(|(i, id)| IndexChunk {
                id: *id,
                start: i as u64 * size,
                size,
            })
            .collect();
        Index::from_chunks(
            ChunkerConfig::new(48, 64, size.max(64)).unwrap(),
            HashFunction::Sha512_256,
            chunks,
        )
    }

    #[test]
    fn longest_match_walks_forward() {
        let a = ChunkId::digest(b"a");
        let b = ChunkId::digest(b"b");
        let c = ChunkId::digest(b"c");
        let seed = FileSeed::new("/nonexistent", index_of(&[a, b, c, a, b], 100));

        // Run of three starting at seed position 0 beats the shorter run
        // at position 3.
        let tail = index_of(&[a, b, c, c], 100).chunks;
        let m = seed.longest_match(&tail).unwrap();
        assert_eq!(m.chunks, 3);
        assert_eq!(m.bytes, 300);

        let tail = index_of(&[b, c], 100).chunks;
        let m = seed.longest_match(&tail).unwrap();
        assert_eq!(m.chunks, 2);

        let tail = index_of(&[ChunkId::digest(b"zz")], 100).chunks;
        assert!(seed.longest_match(&tail).is_none());
    }

    #[test]
    fn invalid_seed_matches_nothing() {
        let a = ChunkId::digest(b"a");
        let seed = FileSeed::new("/nonexistent", index_of(&[a], 100));
        seed.mark_invalid();
        assert!(seed.is_invalid());
        assert!(seed.longest_match(&index_of(&[a], 100).chunks).is_none());
    }

    #[tokio::test]
    async fn segment_writer_copies_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("seed");
        let payload: Vec<u8> = (0..100_000u32).map(|v| v as u8).collect();
        tokio::fs::write(&src_path, &payload).await.unwrap();

        let chunks = vec![
            IndexChunk {
                id: ChunkId::digest(&payload[10_000..60_000]),
                start: 10_000,
                size: 50_000,
            },
            IndexChunk {
                id: ChunkId::digest(&payload[60_000..90_000]),
                start: 60_000,
                size: 30_000,
            },
        ];
        let segment = FileSeedSegment::new(src_path.clone(), chunks);
        assert_eq!(segment.size(), 80_000);

        let mut src = File::open(&src_path).await.unwrap();
        segment.validate(&mut src).await.unwrap();

        let dst_path = dir.path().join("out");
        let mut dst = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&dst_path)
            .await
            .unwrap();
        dst.set_len(200_000).await.unwrap();
        let summary = segment
            .write_into(&mut dst, 5_000, 80_000, 4096, true)
            .await
            .unwrap();
        assert_eq!(summary.copied + summary.cloned, 80_000);
        dst.flush().await.unwrap();

        let out = tokio::fs::read(&dst_path).await.unwrap();
        assert_eq!(&out[5_000..85_000], &payload[10_000..90_000]);

        // Mutate the seed and validation fails.
        let mut corrupted = payload.clone();
        corrupted[20_000] ^= 0xff;
        tokio::fs::write(&src_path, &corrupted).await.unwrap();
        let mut src = File::open(&src_path).await.unwrap();
        assert!(matches!(
            segment.validate(&mut src).await,
            Err(Error::SeedInvalid(_))
        ));
    }
}
