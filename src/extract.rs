//! Seed-aware reconstruction of a blob from an index and a store.

use futures_util::stream::{self, StreamExt};
use log::*;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::chunk::NullChunk;
use crate::error::Error;
use crate::hash::{digest_algorithm, ChunkId};
use crate::index::{Index, IndexChunk};
use crate::reflink::blocksize_of;
use crate::seed::{InvalidSeedAction, NullChunkSeed, Seed, SelfSeed};
use crate::sequencer::{IndexSegment, SeedSequencer, SegmentCandidate};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Number of concurrent workers.
    pub n: usize,
    /// What to do when a seed fails validation.
    pub seed_action: InvalidSeedAction,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            n: match num_cpus::get() {
                0 | 1 => 1,
                n => n,
            },
            seed_action: InvalidSeedAction::BailOut,
        }
    }
}

/// Statistics of one extract invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub total_bytes: u64,
    pub total_chunks: u64,
    pub chunks_from_seeds: u64,
    pub chunks_from_store: u64,
    pub chunks_in_place: u64,
    pub bytes_copied: u64,
    pub bytes_cloned: u64,
    pub seeds: u64,
    pub blocksize: u64,
}

#[derive(Default)]
struct StatCounters {
    chunks_from_seeds: AtomicU64,
    chunks_from_store: AtomicU64,
    chunks_in_place: AtomicU64,
    bytes_copied: AtomicU64,
    bytes_cloned: AtomicU64,
}

struct ExtractContext {
    index: Arc<Index>,
    store: Arc<dyn Store>,
    self_seed: Arc<SelfSeed>,
    stats: StatCounters,
    blocksize: u64,
    is_blank: bool,
    seed_action: InvalidSeedAction,
    cancel: CancellationToken,
}

/// Reconstruct the blob described by `index` into the file at `path`,
/// copying from `seeds` where possible and fetching the rest from `store`.
pub async fn extract(
    index: Index,
    path: &Path,
    store: Arc<dyn Store>,
    user_seeds: Vec<Arc<dyn Seed>>,
    opts: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<ExtractStats, Error> {
    if index.digest_algorithm()? != digest_algorithm() {
        return Err(Error::invalid_format(
            "index digest algorithm differs from the configured one",
        ));
    }
    let index = Arc::new(index);
    let n = opts.n.max(1);

    // Pre-flight: create or size the target and learn what it is.
    let (is_blank, is_device) = match tokio::fs::metadata(path).await {
        Ok(meta) => (
            meta.is_file() && meta.len() == 0,
            is_block_device(&meta),
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (true, false),
        Err(err) => return Err(err.into()),
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .await?;
    if !is_device {
        file.set_len(index.length()).await?;
    }
    let blocksize = blocksize_of(&file).await;
    drop(file);

    // The null-chunk and self seeds go in front of the user seeds.
    let null = Arc::new(NullChunk::new(index.config.max_size));
    let dst_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let self_seed = Arc::new(SelfSeed::new(path, index.clone()));
    let mut seeds: Vec<Arc<dyn Seed>> = vec![
        Arc::new(NullChunkSeed::new(null, dst_dir)),
        self_seed.clone(),
    ];
    seeds.extend(user_seeds);

    // Plan until the seeds validate cleanly against their blobs.
    let mut sequencer = SeedSequencer::new(index.clone(), seeds.clone());
    let plan = loop {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        sequencer.rewind();
        let plan = sequencer.plan();
        let invalid = validate_plan(&plan, n, cancel).await?;
        if invalid.is_empty() {
            break plan;
        }
        match opts.seed_action {
            InvalidSeedAction::BailOut => {
                return Err(Error::SeedInvalid(seed_path(&invalid[0])));
            }
            InvalidSeedAction::Skip => {
                for seed in invalid {
                    warn!("seed {} invalid, skipping it", seed_path(&seed).display());
                    seed.mark_invalid();
                }
            }
            InvalidSeedAction::RegenerateIndex => {
                for seed in invalid {
                    warn!(
                        "seed {} invalid, re-chunking it",
                        seed_path(&seed).display()
                    );
                    seed.mark_invalid();
                    seed.regenerate_index(n, cancel).await?;
                }
            }
        }
    };

    let ctx = Arc::new(ExtractContext {
        index: index.clone(),
        store,
        self_seed,
        stats: StatCounters::default(),
        blocksize,
        is_blank,
        seed_action: opts.seed_action,
        cancel: cancel.child_token(),
    });
    let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = mpsc::channel::<SegmentCandidate>(n * 2);
    let rx = Arc::new(AsyncMutex::new(rx));
    let mut workers = Vec::with_capacity(n);
    for _ in 0..n {
        let ctx = ctx.clone();
        let rx = rx.clone();
        let first_error = first_error.clone();
        let path = path.to_path_buf();
        workers.push(tokio::spawn(async move {
            let result = worker_loop(&ctx, &rx, &path).await;
            if let Err(err) = result {
                let mut slot = first_error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(err);
                }
                drop(slot);
                ctx.cancel.cancel();
            }
        }));
    }

    for candidate in plan {
        tokio::select! {
            sent = tx.send(candidate) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = ctx.cancel.cancelled() => break,
        }
    }
    drop(tx);

    for worker in workers {
        worker.await?;
    }
    if let Some(err) = first_error.lock().unwrap().take() {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }

    Ok(ExtractStats {
        total_bytes: index.length(),
        total_chunks: index.total_chunks() as u64,
        chunks_from_seeds: ctx.stats.chunks_from_seeds.load(Ordering::Relaxed),
        chunks_from_store: ctx.stats.chunks_from_store.load(Ordering::Relaxed),
        chunks_in_place: ctx.stats.chunks_in_place.load(Ordering::Relaxed),
        bytes_copied: ctx.stats.bytes_copied.load(Ordering::Relaxed),
        bytes_cloned: ctx.stats.bytes_cloned.load(Ordering::Relaxed),
        seeds: seeds.len() as u64,
        blocksize,
    })
}

fn seed_path(seed: &Arc<dyn Seed>) -> PathBuf {
    seed.validation_path()
        .map(|p| p.to_path_buf())
        .unwrap_or_default()
}

#[cfg(unix)]
fn is_block_device(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_meta: &std::fs::Metadata) -> bool {
    false
}

/// Check every file-backed candidate of the plan against the current seed
/// bytes, sharing one file handle per seed across `n` workers. Returns the
/// seeds that failed.
async fn validate_plan(
    plan: &[SegmentCandidate],
    n: usize,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<dyn Seed>>, Error> {
    let invalid: Mutex<Vec<Arc<dyn Seed>>> = Mutex::new(Vec::new());
    let mut handles: HashMap<PathBuf, Arc<AsyncMutex<File>>> = HashMap::new();
    let mut jobs = Vec::new();
    for candidate in plan {
        let (seed, writer) = match (&candidate.seed, &candidate.writer) {
            (Some(seed), Some(writer)) => (seed, writer),
            _ => continue,
        };
        let path = match seed.validation_path() {
            Some(path) => path.to_path_buf(),
            None => continue,
        };
        if !handles.contains_key(&path) {
            match File::open(&path).await {
                Ok(file) => {
                    handles.insert(path.clone(), Arc::new(AsyncMutex::new(file)));
                }
                Err(err) => {
                    // A vanished seed blob is an invalid seed, not a fatal
                    // error; the policy decides what happens next.
                    debug!("cannot open seed {}: {}", path.display(), err);
                    push_invalid(&invalid, seed);
                    continue;
                }
            }
        }
        jobs.push((seed.clone(), writer, handles[&path].clone()));
    }

    stream::iter(jobs)
        .for_each_concurrent(n, |(seed, writer, handle)| {
            let invalid = &invalid;
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() || seed.is_invalid() {
                    return;
                }
                let mut file = handle.lock().await;
                if let Err(err) = writer.validate(&mut file).await {
                    debug!("segment validation failed: {}", err);
                    push_invalid(invalid, &seed);
                }
            }
        })
        .await;

    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }
    Ok(invalid.into_inner().unwrap())
}

fn push_invalid(invalid: &Mutex<Vec<Arc<dyn Seed>>>, seed: &Arc<dyn Seed>) {
    let mut list = invalid.lock().unwrap();
    if !list.iter().any(|s| Arc::ptr_eq(s, seed)) {
        list.push(seed.clone());
    }
}

async fn worker_loop(
    ctx: &ExtractContext,
    rx: &AsyncMutex<mpsc::Receiver<SegmentCandidate>>,
    path: &Path,
) -> Result<(), Error> {
    let mut file = OpenOptions::new().read(true).write(true).open(path).await?;
    loop {
        let candidate = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let candidate = match candidate {
            Some(candidate) => candidate,
            None => return Ok(()),
        };
        if ctx.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        match candidate.writer {
            Some(writer) => {
                write_seeded(ctx, &mut file, candidate.segment, writer, candidate.seed).await?
            }
            None => write_single(ctx, &mut file, candidate.segment).await?,
        }
    }
}

/// Materialise a seed-backed segment and re-verify the written bytes
/// against the index; a seed mutated after plan validation is caught here.
async fn write_seeded(
    ctx: &ExtractContext,
    file: &mut File,
    segment: IndexSegment,
    writer: Box<dyn crate::seed::SegmentWriter>,
    seed: Option<Arc<dyn Seed>>,
) -> Result<(), Error> {
    let offset = segment.start(&ctx.index);
    let length = segment.length(&ctx.index);
    let chunks = &ctx.index.chunks[segment.first..=segment.last];
    // On a pre-existing target the segment may already hold the right
    // bytes; rewriting them would miscount a repeated extract.
    if !ctx.is_blank && verify_written(file, chunks).await? {
        ctx.self_seed.add_segment(segment.first, segment.last);
        ctx.stats
            .chunks_in_place
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        return Ok(());
    }
    let summary = writer
        .write_into(file, offset, length, ctx.blocksize, ctx.is_blank)
        .await?;
    file.flush().await?;
    if verify_written(file, chunks).await? {
        ctx.self_seed.add_segment(segment.first, segment.last);
        ctx.stats
            .chunks_from_seeds
            .fetch_add(chunks.len() as u64, Ordering::Relaxed);
        ctx.stats
            .bytes_copied
            .fetch_add(summary.copied, Ordering::Relaxed);
        ctx.stats
            .bytes_cloned
            .fetch_add(summary.cloned, Ordering::Relaxed);
        return Ok(());
    }
    let path = seed
        .as_ref()
        .map(seed_path)
        .unwrap_or_default();
    if let Some(seed) = &seed {
        seed.mark_invalid();
    }
    if ctx.seed_action == InvalidSeedAction::BailOut {
        return Err(Error::SeedInvalid(path));
    }
    // Recover the segment from the store chunk by chunk.
    warn!(
        "seed {} changed under us, falling back to the store",
        path.display()
    );
    for chunk in chunks {
        fetch_into(ctx, file, chunk).await?;
        ctx.stats.chunks_from_store.fetch_add(1, Ordering::Relaxed);
    }
    file.flush().await?;
    ctx.self_seed.add_segment(segment.first, segment.last);
    Ok(())
}

/// A single chunk with no planned source: the self seed may have gained it
/// meanwhile, the file may already hold the right bytes, or it comes from
/// the store.
async fn write_single(
    ctx: &ExtractContext,
    file: &mut File,
    segment: IndexSegment,
) -> Result<(), Error> {
    let chunk = ctx.index.chunks[segment.first];
    if let Some(found) = ctx.self_seed.longest_match(std::slice::from_ref(&chunk)) {
        let summary = found
            .writer
            .write_into(file, chunk.start, chunk.size, ctx.blocksize, ctx.is_blank)
            .await?;
        file.flush().await?;
        if verify_written(file, std::slice::from_ref(&chunk)).await? {
            ctx.self_seed.add_segment(segment.first, segment.last);
            ctx.stats.chunks_from_seeds.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .bytes_copied
                .fetch_add(summary.copied, Ordering::Relaxed);
            ctx.stats
                .bytes_cloned
                .fetch_add(summary.cloned, Ordering::Relaxed);
            return Ok(());
        }
    }
    if !ctx.is_blank {
        file.seek(SeekFrom::Start(chunk.start)).await?;
        let mut buf = vec![0u8; chunk.size as usize];
        file.read_exact(&mut buf).await?;
        if ChunkId::digest(&buf) == chunk.id {
            ctx.self_seed.add_segment(segment.first, segment.last);
            ctx.stats.chunks_in_place.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    }
    fetch_into(ctx, file, &chunk).await?;
    file.flush().await?;
    ctx.self_seed.add_segment(segment.first, segment.last);
    ctx.stats.chunks_from_store.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn fetch_into(ctx: &ExtractContext, file: &mut File, chunk: &IndexChunk) -> Result<(), Error> {
    let mut fetched = ctx.store.get_chunk(&chunk.id).await?;
    let data = fetched.data()?;
    if data.len() as u64 != chunk.size {
        return Err(Error::invalid_format(format!(
            "chunk {} is {} bytes, index says {}",
            chunk.id,
            data.len(),
            chunk.size
        )));
    }
    file.seek(SeekFrom::Start(chunk.start)).await?;
    file.write_all(data).await?;
    Ok(())
}

async fn verify_written(file: &mut File, chunks: &[IndexChunk]) -> Result<bool, Error> {
    if chunks.is_empty() {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(chunks[0].start)).await?;
    let mut buf = Vec::new();
    for chunk in chunks {
        buf.resize(chunk.size as usize, 0);
        file.read_exact(&mut buf).await?;
        if ChunkId::digest(&buf) != chunk.id {
            return Ok(false);
        }
    }
    Ok(true)
}
