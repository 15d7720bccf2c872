use std::sync::Arc;

use crate::index::Index;
use crate::seed::{Seed, SeedMatch, SegmentWriter};

/// Contiguous run `[first, last]` of index chunks materialised as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSegment {
    pub first: usize,
    pub last: usize,
}

impl IndexSegment {
    pub fn chunks(&self) -> usize {
        self.last - self.first + 1
    }
    pub fn start(&self, index: &Index) -> u64 {
        index.chunks[self.first].start
    }
    pub fn length(&self, index: &Index) -> u64 {
        index.chunks[self.first..=self.last]
            .iter()
            .map(|c| c.size)
            .sum()
    }
}

/// A planned segment: where the bytes come from. `writer` is `None` for a
/// single chunk that has to be fetched from the store.
pub struct SegmentCandidate {
    pub segment: IndexSegment,
    pub seed: Option<Arc<dyn Seed>>,
    pub writer: Option<Box<dyn SegmentWriter>>,
}

/// Greedy partition of an index into seed-backed runs and store chunks.
///
/// At every cursor position the seed offering the most bytes wins; ties go
/// to the earlier seed, which by convention places the null-chunk and self
/// seeds before user seeds.
pub struct SeedSequencer {
    index: Arc<Index>,
    seeds: Vec<Arc<dyn Seed>>,
    cursor: usize,
}

impl SeedSequencer {
    pub fn new(index: Arc<Index>, seeds: Vec<Arc<dyn Seed>>) -> Self {
        Self {
            index,
            seeds,
            cursor: 0,
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn next(&mut self) -> Option<SegmentCandidate> {
        if self.cursor >= self.index.chunks.len() {
            return None;
        }
        let tail = &self.index.chunks[self.cursor..];
        let mut best: Option<(usize, SeedMatch)> = None;
        for (i, seed) in self.seeds.iter().enumerate() {
            if let Some(found) = seed.longest_match(tail) {
                let better = match &best {
                    Some((_, current)) => found.bytes > current.bytes,
                    None => true,
                };
                if better {
                    best = Some((i, found));
                }
            }
        }
        let candidate = match best {
            Some((seed_idx, found)) => {
                let segment = IndexSegment {
                    first: self.cursor,
                    last: self.cursor + found.chunks - 1,
                };
                self.cursor += found.chunks;
                SegmentCandidate {
                    segment,
                    seed: Some(self.seeds[seed_idx].clone()),
                    writer: Some(found.writer),
                }
            }
            None => {
                let segment = IndexSegment {
                    first: self.cursor,
                    last: self.cursor,
                };
                self.cursor += 1;
                SegmentCandidate {
                    segment,
                    seed: None,
                    writer: None,
                }
            }
        };
        Some(candidate)
    }

    /// Drain the sequencer into an ordered plan covering the whole index.
    pub fn plan(&mut self) -> Vec<SegmentCandidate> {
        let mut plan = Vec::new();
        while let Some(candidate) = self.next() {
            plan.push(candidate);
        }
        plan
    }
}
