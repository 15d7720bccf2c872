use clap::ArgMatches;
use log::*;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use castr::size_str::size_to_str;
use castr::{chop_blob, index_from_path, open_store, ChunkerConfig, Error, StoreOptions};

pub async fn run(matches: &ArgMatches<'_>, cancel: &CancellationToken) -> Result<(), Error> {
    let index_path = Path::new(matches.value_of("INDEX").unwrap());
    let input = Path::new(matches.value_of("INPUT").unwrap());
    let config = match matches.value_of("chunk-size") {
        Some(sizes) => crate::parse_chunk_sizes(sizes)?,
        None => ChunkerConfig::default(),
    };
    let n = crate::concurrency_arg(matches)?;

    info!("chunking {}", input.display());
    let index = index_from_path(input, &config, n, cancel).await?;
    info!(
        "{} chunks over {}",
        index.total_chunks(),
        size_to_str(index.length())
    );

    if let Some(location) = matches.value_of("store") {
        let store_opts = StoreOptions {
            converters: crate::converters_arg(matches)?,
            ..StoreOptions::default()
        };
        let store = open_store(location, &store_opts).await?;
        let written = chop_blob(input, &index, store, n, cancel).await?;
        info!("stored {} new chunks in {}", written, location);
    }

    index.to_path(index_path).await?;
    info!("wrote index {}", index_path.display());
    Ok(())
}
