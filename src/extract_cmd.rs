use clap::ArgMatches;
use log::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use castr::size_str::size_to_str;
use castr::{
    extract, open_store, CacheStore, DedupStore, Error, ExtractOptions, FileSeed, Index,
    InvalidSeedAction, LocalStore, Seed, Store, StoreOptions, StoreRouter,
};

fn u64_arg(matches: &ArgMatches<'_>, name: &str, default: u64) -> Result<u64, Error> {
    match matches.value_of(name) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::ConfigInvalid("invalid numeric argument")),
        None => Ok(default),
    }
}

pub async fn run(matches: &ArgMatches<'_>, cancel: &CancellationToken) -> Result<(), Error> {
    let index_path = Path::new(matches.value_of("INDEX").unwrap());
    let output = Path::new(matches.value_of("OUTPUT").unwrap());
    let index = Index::from_path(index_path).await?;
    // The index says which digest its ids were derived with.
    castr::set_digest_algorithm(index.digest_algorithm()?);

    let store_opts = StoreOptions {
        converters: crate::converters_arg(matches)?,
        error_retry: u64_arg(matches, "http-retry-count", 0)? as u32,
        error_retry_delay: Duration::from_secs(u64_arg(matches, "http-retry-delay", 1)?),
        receive_timeout: matches
            .value_of("http-timeout")
            .map(|v| {
                v.parse()
                    .map(Duration::from_secs)
                    .map_err(|_| Error::ConfigInvalid("invalid http timeout"))
            })
            .transpose()?,
    };

    let mut stores = Vec::new();
    if let Some(locations) = matches.values_of("store") {
        for location in locations {
            stores.push(open_store(location, &store_opts).await?);
        }
    }
    if stores.is_empty() {
        return Err(Error::ConfigInvalid("at least one --store is required"));
    }
    let store: Arc<dyn Store> = if stores.len() == 1 {
        stores.remove(0)
    } else {
        Arc::new(StoreRouter::new(stores))
    };
    let store: Arc<dyn Store> = match matches.value_of("cache") {
        Some(cache_dir) => {
            let cache = LocalStore::new(cache_dir, store_opts.converters.clone()).await?;
            Arc::new(CacheStore::new(store, Arc::new(cache)))
        }
        None => store,
    };
    // Collapse concurrent requests for the same chunk.
    let store: Arc<dyn Store> = Arc::new(DedupStore::new(store));

    let mut seeds: Vec<Arc<dyn Seed>> = Vec::new();
    if let Some(blobs) = matches.values_of("seed") {
        for blob in blobs {
            let blob = PathBuf::from(blob);
            let mut seed_index_path = blob.clone().into_os_string();
            seed_index_path.push(".caibx");
            let seed_index = Index::from_path(Path::new(&seed_index_path)).await?;
            debug!("seed {} with {} chunks", blob.display(), seed_index.total_chunks());
            seeds.push(Arc::new(FileSeed::new(blob, seed_index)));
        }
    }

    let extract_opts = ExtractOptions {
        n: crate::concurrency_arg(matches)?,
        seed_action: match matches.value_of("seed-invalid") {
            Some("skip") => InvalidSeedAction::Skip,
            Some("regenerate") => InvalidSeedAction::RegenerateIndex,
            _ => InvalidSeedAction::BailOut,
        },
    };

    info!(
        "extracting {} to {}",
        index_path.display(),
        output.display()
    );
    let stats = extract(index, output, store, seeds, &extract_opts, cancel).await?;
    info!(
        "extracted {} in {} chunks: {} from seeds, {} from store, {} kept in place",
        size_to_str(stats.total_bytes),
        stats.total_chunks,
        stats.chunks_from_seeds,
        stats.chunks_from_store,
        stats.chunks_in_place,
    );
    info!(
        "{} copied, {} cloned from {} seeds (blocksize {})",
        size_to_str(stats.bytes_copied),
        size_to_str(stats.bytes_cloned),
        stats.seeds,
        stats.blocksize,
    );
    Ok(())
}
