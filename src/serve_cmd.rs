use clap::ArgMatches;
use log::*;
use tokio_util::sync::CancellationToken;

use castr::protocol::serve_store;
use castr::{Error, LocalStore};

pub async fn run(matches: &ArgMatches<'_>, cancel: &CancellationToken) -> Result<(), Error> {
    let root = matches.value_of("STORE").unwrap();
    let store = LocalStore::new(root, castr::Converters::compressed()).await?;
    let writable = matches.is_present("writable");
    info!(
        "serving {} over stdio ({})",
        root,
        if writable { "read-write" } else { "read-only" }
    );
    tokio::select! {
        result = serve_store(tokio::io::stdin(), tokio::io::stdout(), &store, writable) => result,
        _ = cancel.cancelled() => Err(Error::Interrupted),
    }
}
