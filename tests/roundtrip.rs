//! Whole-pipeline tests: chunk a blob, fill a store, extract it back.

use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use castr::{
    chop_blob, extract, index_from_path, CacheStore, ChunkerConfig, DedupStore, Error,
    ExtractOptions, ExtractStats, FileSeed, Index, InvalidSeedAction, MemStore, NullChunk, Seed,
    Store,
};

fn config() -> ChunkerConfig {
    ChunkerConfig::new(16 * 1024, 64 * 1024, 256 * 1024).unwrap()
}

fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn opts(seed_action: InvalidSeedAction) -> ExtractOptions {
    ExtractOptions { n: 4, seed_action }
}

async fn index_of(path: &Path) -> Index {
    index_from_path(path, &config(), 3, &CancellationToken::new())
        .await
        .unwrap()
}

/// Write `data` to `name` under `dir` and index it.
async fn blob_with_index(dir: &Path, name: &str, data: &[u8]) -> (PathBuf, Index) {
    let path = dir.join(name);
    tokio::fs::write(&path, data).await.unwrap();
    let index = index_of(&path).await;
    (path, index)
}

async fn filled_store(path: &Path, index: &Index) -> Arc<MemStore> {
    let store = Arc::new(MemStore::new("test"));
    chop_blob(path, index, store.clone(), 4, &CancellationToken::new())
        .await
        .unwrap();
    store
}

async fn run_extract(
    index: Index,
    out: &Path,
    store: Arc<dyn Store>,
    seeds: Vec<Arc<dyn Seed>>,
    seed_action: InvalidSeedAction,
) -> Result<ExtractStats, Error> {
    extract(
        index,
        out,
        store,
        seeds,
        &opts(seed_action),
        &CancellationToken::new(),
    )
    .await
}

#[tokio::test]
async fn extract_rebuilds_the_exact_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(1536 * 1024 + 7, 1);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;

    let out = dir.path().join("out");
    let stats = run_extract(
        index.clone(),
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();

    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert_eq!(stats.total_bytes, data.len() as u64);
    assert_eq!(stats.total_chunks, index.total_chunks() as u64);
    assert_eq!(
        stats.chunks_from_store + stats.chunks_from_seeds + stats.chunks_in_place,
        stats.total_chunks
    );
}

#[tokio::test]
async fn second_extract_keeps_everything_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(1024 * 1024, 2);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;

    let out = dir.path().join("out");
    run_extract(
        index.clone(),
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    let gets_after_first = store.gets();

    let stats = run_extract(
        index.clone(),
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert_eq!(stats.chunks_in_place, stats.total_chunks);
    assert_eq!(stats.chunks_from_store, 0);
    // No further fetches were issued.
    assert_eq!(store.gets(), gets_after_first);
}

#[tokio::test]
async fn all_zero_blob_extracts_without_a_store() {
    let dir = tempfile::tempdir().unwrap();
    let data = vec![0u8; 1024 * 1024];
    let (_blob, index) = blob_with_index(dir.path(), "zeros", &data).await;

    // Four max-size chunks, all carrying the null-chunk id.
    let null = NullChunk::new(config().max_size);
    assert_eq!(index.total_chunks(), 4);
    for (i, chunk) in index.chunks.iter().enumerate() {
        assert_eq!(chunk.start, i as u64 * 256 * 1024);
        assert_eq!(chunk.id, null.id);
    }

    // The null-chunk seed serves everything; the store stays untouched.
    let store = Arc::new(MemStore::new("empty"));
    let out = dir.path().join("out");
    let stats = run_extract(
        index.clone(),
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert_eq!(stats.chunks_from_seeds, 4);
    assert_eq!(stats.chunks_from_store, 0);
    assert_eq!(store.gets(), 0);

    // Running it again leaves the correct zeros alone.
    let stats = run_extract(
        index,
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert_eq!(stats.chunks_in_place, stats.total_chunks);
    assert_eq!(stats.chunks_from_seeds, 0);
    assert_eq!(stats.chunks_from_store, 0);
    assert_eq!(store.gets(), 0);
}

#[tokio::test]
async fn second_extract_with_null_runs_keeps_everything_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = random_data(300 * 1024, 12);
    data.extend_from_slice(&vec![0u8; 768 * 1024]);
    data.extend_from_slice(&random_data(300 * 1024, 13));
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;

    let out = dir.path().join("out");
    run_extract(
        index.clone(),
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    let gets_after_first = store.gets();

    let stats = run_extract(
        index,
        &out,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    // The null run and the content chunks are all detected as already
    // correct, nothing is rewritten or fetched.
    assert_eq!(stats.chunks_in_place, stats.total_chunks);
    assert_eq!(stats.chunks_from_seeds, 0);
    assert_eq!(stats.chunks_from_store, 0);
    assert_eq!(store.gets(), gets_after_first);
}

#[tokio::test]
async fn empty_index_writes_an_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let (_blob, index) = blob_with_index(dir.path(), "empty", &[]).await;
    assert_eq!(index.total_chunks(), 0);

    let out = dir.path().join("out");
    let stats = run_extract(
        index,
        &out,
        Arc::new(MemStore::new("empty")),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(stats.total_bytes, 0);
    assert_eq!(tokio::fs::metadata(&out).await.unwrap().len(), 0);
}

#[tokio::test]
async fn full_seed_avoids_the_store_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(900 * 1024, 3);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let seed_index = index.clone();

    let store = Arc::new(MemStore::new("unused"));
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(blob, seed_index))];
    let out = dir.path().join("out");
    let stats = run_extract(
        index,
        &out,
        store.clone(),
        seeds,
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    assert_eq!(stats.chunks_from_store, 0);
    assert_eq!(stats.chunks_from_seeds, stats.total_chunks);
    assert!(stats.bytes_copied + stats.bytes_cloned >= stats.total_bytes);
    assert_eq!(store.gets(), 0);
}

#[tokio::test]
async fn partial_seed_covers_the_shared_run() {
    let dir = tempfile::tempdir().unwrap();
    let shared = random_data(600 * 1024, 4);
    let mut data = random_data(300 * 1024, 5);
    data.extend_from_slice(&shared);
    data.extend_from_slice(&random_data(300 * 1024, 6));

    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;
    let (seed_blob, seed_index) = blob_with_index(dir.path(), "seed", &shared).await;

    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(seed_blob, seed_index))];
    let out = dir.path().join("out");
    let stats = run_extract(
        index,
        &out,
        store.clone(),
        seeds,
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    // The seed serves the interior of the shared region, the store only
    // the complement.
    assert!(stats.chunks_from_seeds > 0);
    assert!(stats.chunks_from_store < stats.total_chunks);
    assert_eq!(store.gets(), stats.chunks_from_store);
}

#[tokio::test]
async fn mutated_seed_bails_out() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(800 * 1024, 7);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;
    let (seed_blob, seed_index) = blob_with_index(dir.path(), "seed", &data).await;

    // The seed blob changes after its index was computed.
    let mut mutated = data.clone();
    mutated[400_000] ^= 0xff;
    tokio::fs::write(&seed_blob, &mutated).await.unwrap();

    let out = dir.path().join("out");
    let seeds: Vec<Arc<dyn Seed>> =
        vec![Arc::new(FileSeed::new(seed_blob.clone(), seed_index.clone()))];
    match run_extract(
        index.clone(),
        &out,
        store.clone(),
        seeds,
        InvalidSeedAction::BailOut,
    )
    .await
    {
        Err(Error::SeedInvalid(path)) => assert_eq!(path, seed_blob),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn mutated_seed_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(800 * 1024, 8);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;
    let (seed_blob, seed_index) = blob_with_index(dir.path(), "seed", &data).await;
    let mut mutated = data.clone();
    mutated[100] ^= 0xff;
    tokio::fs::write(&seed_blob, &mutated).await.unwrap();

    let out = dir.path().join("out");
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(seed_blob, seed_index))];
    let stats = run_extract(
        index,
        &out,
        store.clone(),
        seeds,
        InvalidSeedAction::Skip,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    // The whole seed was dropped, everything came from the store.
    assert_eq!(stats.chunks_from_store, stats.total_chunks);
}

#[tokio::test]
async fn mutated_seed_regenerates_and_still_helps() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(800 * 1024, 9);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let store = filled_store(&blob, &index).await;
    let (seed_blob, seed_index) = blob_with_index(dir.path(), "seed", &data).await;
    let mut mutated = data.clone();
    mutated[400_000] ^= 0xff;
    tokio::fs::write(&seed_blob, &mutated).await.unwrap();

    let out = dir.path().join("out");
    let seeds: Vec<Arc<dyn Seed>> = vec![Arc::new(FileSeed::new(seed_blob, seed_index))];
    let stats = run_extract(
        index,
        &out,
        store.clone(),
        seeds,
        InvalidSeedAction::RegenerateIndex,
    )
    .await
    .unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
    // After re-chunking, the seed serves everything but the mutated spot.
    assert!(stats.chunks_from_seeds > 0);
    assert!(stats.chunks_from_store > 0);
    assert!(stats.chunks_from_store < stats.total_chunks);
}

#[tokio::test]
async fn cache_and_dedup_fetch_each_chunk_once() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_data(1024 * 1024, 10);
    let (blob, index) = blob_with_index(dir.path(), "blob", &data).await;
    let remote = filled_store(&blob, &index).await;
    let gets_from_chop = remote.gets();

    let cache = Arc::new(MemStore::new("cache"));
    let store: Arc<dyn Store> = Arc::new(DedupStore::new(Arc::new(CacheStore::new(
        remote.clone(),
        cache.clone(),
    ))));

    let out_a = dir.path().join("a");
    let out_b = dir.path().join("b");
    run_extract(
        index.clone(),
        &out_a,
        store.clone(),
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();
    run_extract(
        index.clone(),
        &out_b,
        store,
        Vec::new(),
        InvalidSeedAction::BailOut,
    )
    .await
    .unwrap();

    assert_eq!(tokio::fs::read(&out_a).await.unwrap(), data);
    assert_eq!(tokio::fs::read(&out_b).await.unwrap(), data);
    // The slow store saw each chunk once, not once per extract.
    assert_eq!(
        remote.gets() - gets_from_chop,
        index.total_chunks() as u64
    );
}
