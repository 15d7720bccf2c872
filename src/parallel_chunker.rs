//! Multi-worker chunker producing the same index as the serial one.
//!
//! The file is split among `n` workers at staggered offsets. Every worker
//! runs a serial chunker and posts produced chunks to its bounded queue;
//! after each chunk it asks the downstream worker whether the same chunk
//! already sits in that worker's queue, and stops once it does, because
//! from that point on both would produce identical output. The consumer
//! drains the queues in worker order, discarding the downstream entries
//! that precede the handover point.

use log::*;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::chunk::NullChunk;
use crate::chunker::{Chunker, ChunkerConfig};
use crate::error::Error;
use crate::hash::{digest_algorithm, ChunkId};
use crate::index::{Index, IndexChunk};

const WORKER_QUEUE_MAX: usize = 256;

struct WorkerQueue {
    state: Mutex<QueueState>,
    produced: Notify,
    space: Notify,
    null_id: ChunkId,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<IndexChunk>,
    done: bool,
    eof: bool,
}

enum SyncProbe {
    /// The chunk is in the downstream queue; the blob is partitioned here.
    Found,
    /// The downstream queue continues with a run of null chunks; this many
    /// may be skipped without rescanning.
    NullRun(u64),
    NotFound,
}

impl WorkerQueue {
    fn new(null_id: ChunkId) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            produced: Notify::new(),
            space: Notify::new(),
            null_id,
        }
    }

    async fn push(&self, chunk: IndexChunk, cancel: &CancellationToken) -> Result<(), Error> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if state.chunks.len() < WORKER_QUEUE_MAX {
                    state.chunks.push_back(chunk);
                    drop(state);
                    self.produced.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.space.notified() => {}
                _ = cancel.cancelled() => return Err(Error::Interrupted),
            }
        }
    }

    /// Answer an upstream worker's sync query for `chunk`.
    fn find_sync(&self, chunk: &IndexChunk) -> SyncProbe {
        let state = self.state.lock().unwrap();
        if state.chunks.iter().any(|q| q.start == chunk.start) {
            return SyncProbe::Found;
        }
        if chunk.id == self.null_id {
            // Count the null run right after the query position. Its
            // leading chunk must start within the queried chunk, which
            // pins the zero region to the upstream worker's position.
            let mut run = state
                .chunks
                .iter()
                .skip_while(|q| q.start < chunk.start)
                .peekable();
            if let Some(first) = run.peek() {
                if first.start <= chunk.end() && first.id == self.null_id {
                    let count = run.take_while(|q| q.id == self.null_id).count() as u64;
                    return SyncProbe::NullRun(count.saturating_sub(1));
                }
            }
        }
        SyncProbe::NotFound
    }
}

/// Chunk the file at `path` with `n` workers and build its index. The
/// result is identical to a serial run over the whole file.
pub async fn index_from_path(
    path: &Path,
    config: &ChunkerConfig,
    n: usize,
    cancel: &CancellationToken,
) -> Result<Index, Error> {
    let n = n.max(1);
    let file_size = tokio::fs::metadata(path).await?.len();
    let stride = file_size / n as u64;
    let n = if stride == 0 { 1 } else { n };

    let null_id = NullChunk::new(config.max_size).id;
    let queues: Vec<Arc<WorkerQueue>> = (0..n).map(|_| Arc::new(WorkerQueue::new(null_id))).collect();

    let worker_cancel = cancel.child_token();
    let mut workers = Vec::with_capacity(n);
    for i in 0..n {
        let path = path.to_path_buf();
        let config = *config;
        let my = queues[i].clone();
        let next = queues.get(i + 1).cloned();
        let cancel = worker_cancel.clone();
        workers.push(tokio::spawn(async move {
            let result = worker_run(&path, &config, i as u64 * stride, &my, next, &cancel).await;
            {
                let mut state = my.state.lock().unwrap();
                state.done = true;
                state.eof = matches!(result, Ok(true));
            }
            my.produced.notify_one();
            result.map(|_| ())
        }));
    }

    let drained = drain(&queues, cancel).await;
    // Workers past the handover points have nothing left to contribute.
    worker_cancel.cancel();
    let mut first_worker_error = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) | Ok(Err(Error::Interrupted)) => {}
            Ok(Err(err)) => {
                if first_worker_error.is_none() {
                    first_worker_error = Some(err);
                }
            }
            Err(join_err) => {
                if first_worker_error.is_none() {
                    first_worker_error = Some(join_err.into());
                }
            }
        }
    }
    match drained {
        Ok(chunks) => {
            debug!("chunked {} into {} chunks", path.display(), chunks.len());
            Ok(Index::from_chunks(*config, digest_algorithm(), chunks))
        }
        Err(err) => Err(first_worker_error.unwrap_or(err)),
    }
}

async fn worker_run(
    path: &Path,
    config: &ChunkerConfig,
    start: u64,
    my: &WorkerQueue,
    next: Option<Arc<WorkerQueue>>,
    cancel: &CancellationToken,
) -> Result<bool, Error> {
    let mut file = File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let mut chunker = Chunker::with_offset(config, &mut file, start);
    let null_size = config.max_size;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        let (chunk_start, data) = match chunker.next_chunk().await? {
            Some(produced) => produced,
            None => return Ok(true),
        };
        let chunk = IndexChunk {
            id: ChunkId::digest(&data),
            start: chunk_start,
            size: data.len() as u64,
        };
        drop(data);
        my.push(chunk, cancel).await?;
        let next = match &next {
            Some(next) => next,
            None => continue,
        };
        match next.find_sync(&chunk) {
            SyncProbe::Found => return Ok(false),
            SyncProbe::NullRun(skip) if skip > 0 => {
                // The downstream worker already hashed this zero region;
                // skip it and emit the null entries directly.
                chunker.advance(skip * null_size).await?;
                for k in 0..skip {
                    let synthetic = IndexChunk {
                        id: chunk.id,
                        start: chunk.end() + k * null_size,
                        size: null_size,
                    };
                    my.push(synthetic, cancel).await?;
                    if matches!(next.find_sync(&synthetic), SyncProbe::Found) {
                        return Ok(false);
                    }
                }
            }
            _ => {}
        }
    }
}

async fn drain(
    queues: &[Arc<WorkerQueue>],
    cancel: &CancellationToken,
) -> Result<Vec<IndexChunk>, Error> {
    let mut chunks = Vec::new();
    let mut pos = 0u64;
    for queue in queues {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let mut worker_finished = false;
            let mut at_eof = false;
            {
                let mut state = queue.state.lock().unwrap();
                loop {
                    match state.chunks.front().copied() {
                        // Entries before the handover point were produced
                        // by the upstream worker already.
                        Some(front) if front.start < pos => {
                            state.chunks.pop_front();
                            queue.space.notify_one();
                        }
                        Some(front) if front.start == pos => {
                            state.chunks.pop_front();
                            queue.space.notify_one();
                            pos = front.end();
                            chunks.push(front);
                        }
                        // A gap means the worker died before covering it.
                        Some(_) => return Err(Error::Interrupted),
                        None => break,
                    }
                }
                if state.done && state.chunks.is_empty() {
                    worker_finished = true;
                    at_eof = state.eof;
                }
            }
            if worker_finished {
                if at_eof {
                    // The file ends inside this worker's territory; the
                    // remaining workers hold nothing relevant.
                    return Ok(chunks);
                }
                break;
            }
            tokio::select! {
                _ = queue.produced.notified() => {}
                _ = cancel.cancelled() => return Err(Error::Interrupted),
            }
        }
    }
    Ok(chunks)
}
