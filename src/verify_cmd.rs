use clap::ArgMatches;
use log::*;
use tokio_util::sync::CancellationToken;

use castr::{Error, LocalStore};

pub async fn run(matches: &ArgMatches<'_>, cancel: &CancellationToken) -> Result<(), Error> {
    let root = matches.value_of("STORE").unwrap();
    let store = LocalStore::new(root, crate::converters_arg(matches)?).await?;
    let stats = store
        .verify(
            crate::concurrency_arg(matches)?,
            matches.is_present("repair"),
            cancel,
        )
        .await?;
    if stats.corrupt > 0 {
        warn!(
            "{} of {} chunks corrupt in {} ({} removed)",
            stats.corrupt, stats.chunks, root, stats.removed
        );
    } else {
        info!("all {} chunks in {} verified", stats.chunks, root);
    }
    Ok(())
}
