use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::hash::ChunkId;
use crate::index::{Index, IndexChunk};
use crate::seed::file::FileSeedSegment;
use crate::seed::{Seed, SeedMatch, SegmentWriter};

/// Seed fed by the extractor with its own output.
///
/// Segments complete out of order, but a chunk may only be advertised once
/// everything before it is on disk. Completed segments go into a pending
/// set; a monotonic write cursor publishes chunk positions as the prefix
/// below it becomes contiguous.
pub struct SelfSeed {
    path: PathBuf,
    index: Arc<Index>,
    inner: Mutex<SelfSeedInner>,
}

struct SelfSeedInner {
    cursor: usize,
    pending: HashSet<usize>,
    positions: HashMap<ChunkId, Vec<usize>>,
}

impl SelfSeed {
    pub fn new(path: impl Into<PathBuf>, index: Arc<Index>) -> Self {
        Self {
            path: path.into(),
            index,
            inner: Mutex::new(SelfSeedInner {
                cursor: 0,
                pending: HashSet::new(),
                positions: HashMap::new(),
            }),
        }
    }

    /// Record the index range `[first, last]` as written to the output and
    /// advance the write cursor over any contiguous prefix.
    pub fn add_segment(&self, first: usize, last: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.extend(first..=last);
        loop {
            let cursor = inner.cursor;
            if !inner.pending.remove(&cursor) {
                break;
            }
            let id = self.index.chunks[cursor].id;
            inner.positions.entry(id).or_default().push(cursor);
            inner.cursor += 1;
        }
    }

    #[cfg(test)]
    fn cursor(&self) -> usize {
        self.inner.lock().unwrap().cursor
    }
}

#[async_trait]
impl Seed for SelfSeed {
    fn longest_match(&self, tail: &[IndexChunk]) -> Option<SeedMatch> {
        if tail.is_empty() {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        let candidates = inner.positions.get(&tail[0].id)?;
        let mut best = 0;
        let mut best_at = 0;
        for &j in candidates {
            let mut n = 0;
            // Only chunks below the cursor are guaranteed on disk.
            while j + n < inner.cursor && n < tail.len() && self.index.chunks[j + n].id == tail[n].id
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
        let chunks = self.index.chunks[best_at..best_at + best].to_vec();
        let bytes = chunks.iter().map(|c| c.size).sum();
        Some(SeedMatch {
            chunks: best,
            bytes,
            writer: Box::new(FileSeedSegment::new(self.path.clone(), chunks))
                as Box<dyn SegmentWriter>,
        })
    }

    async fn regenerate_index(&self, _n: usize, _cancel: &CancellationToken) -> Result<(), Error> {
        // The published prefix is re-verified after every write, there is
        // nothing to regenerate.
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
