mod extract_cmd;
mod make_cmd;
mod serve_cmd;
mod verify_cmd;

use clap::{App, Arg, SubCommand};
use log::*;
use tokio_util::sync::CancellationToken;

use castr::{set_digest_algorithm, ChunkerConfig, HashFunction};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

fn parse_size(size_str: &str) -> Result<u64, castr::Error> {
    let size_val: String = size_str.chars().filter(|a| a.is_numeric()).collect();
    let size_unit: String = size_str.chars().filter(|a| !a.is_numeric()).collect();
    let size_val: u64 = size_val
        .parse()
        .map_err(|_| castr::Error::ConfigInvalid("invalid chunk size value"))?;
    match size_unit.as_str() {
        "" | "B" => Ok(size_val),
        "KiB" => Ok(1024 * size_val),
        "MiB" => Ok(1024 * 1024 * size_val),
        "GiB" => Ok(1024 * 1024 * 1024 * size_val),
        _ => Err(castr::Error::ConfigInvalid("invalid chunk size unit")),
    }
}

/// Parse a `min:avg:max` chunk size triple, eg `16KiB:64KiB:256KiB`.
fn parse_chunk_sizes(arg: &str) -> Result<ChunkerConfig, castr::Error> {
    let parts: Vec<&str> = arg.split(':').collect();
    if parts.len() != 3 {
        return Err(castr::Error::ConfigInvalid(
            "chunk size must be given as min:avg:max",
        ));
    }
    ChunkerConfig::new(
        parse_size(parts[0])?,
        parse_size(parts[1])?,
        parse_size(parts[2])?,
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new(PKG_NAME)
        .version(PKG_VERSION)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Set log level verbosity"),
        )
        .arg(
            Arg::with_name("digest")
                .long("digest")
                .value_name("ALGORITHM")
                .possible_values(&["sha512-256", "sha256"])
                .global(true)
                .help("Digest algorithm for chunk ids [default: sha512-256]"),
        )
        .subcommand(
            SubCommand::with_name("make")
                .about("Chunk a blob and write its index, optionally filling a store.")
                .arg(
                    Arg::with_name("INDEX")
                        .value_name("INDEX")
                        .help("Index file to create")
                        .required(true),
                )
                .arg(
                    Arg::with_name("INPUT")
                        .value_name("INPUT")
                        .help("Blob to chunk")
                        .required(true),
                )
                .arg(
                    Arg::with_name("store")
                        .short("s")
                        .long("store")
                        .value_name("STORE")
                        .help("Store to fill with the blob's chunks"),
                )
                .arg(
                    Arg::with_name("chunk-size")
                        .long("chunk-size")
                        .value_name("MIN:AVG:MAX")
                        .help("Chunk size limits [default: 16KiB:64KiB:256KiB]"),
                )
                .arg(
                    Arg::with_name("concurrency")
                        .short("n")
                        .long("concurrency")
                        .value_name("N")
                        .help("Number of workers [default: number of cores]"),
                )
                .arg(
                    Arg::with_name("uncompressed")
                        .long("uncompressed")
                        .help("Store chunks without compression"),
                )
                .arg(
                    Arg::with_name("encrypt")
                        .long("encrypt")
                        .value_name("CIPHER")
                        .possible_values(&["aes-256-ctr", "aes-256-gcm", "xchacha20-poly1305"])
                        .help("Encrypt stored chunks; passphrase read from $CASTR_PASSPHRASE"),
                ),
        )
        .subcommand(
            SubCommand::with_name("extract")
                .about("Reconstruct a blob from an index, seeds and stores.")
                .arg(
                    Arg::with_name("INDEX")
                        .value_name("INDEX")
                        .help("Index file to extract")
                        .required(true),
                )
                .arg(
                    Arg::with_name("OUTPUT")
                        .value_name("OUTPUT")
                        .help("Target file or block device")
                        .required(true),
                )
                .arg(
                    Arg::with_name("store")
                        .short("s")
                        .long("store")
                        .value_name("STORE")
                        .multiple(true)
                        .number_of_values(1)
                        .help("Chunk store (directory, http(s):// or ssh:// URL); repeatable"),
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .value_name("BLOB")
                        .multiple(true)
                        .number_of_values(1)
                        .help("Seed blob; its index is expected at <BLOB>.caibx"),
                )
                .arg(
                    Arg::with_name("cache")
                        .short("c")
                        .long("cache")
                        .value_name("DIR")
                        .help("Local store used as a chunk cache"),
                )
                .arg(
                    Arg::with_name("seed-invalid")
                        .long("seed-invalid")
                        .value_name("ACTION")
                        .possible_values(&["bail-out", "skip", "regenerate"])
                        .help("Action when a seed no longer matches its index [default: bail-out]"),
                )
                .arg(
                    Arg::with_name("concurrency")
                        .short("n")
                        .long("concurrency")
                        .value_name("N")
                        .help("Number of workers [default: number of cores]"),
                )
                .arg(
                    Arg::with_name("uncompressed")
                        .long("uncompressed")
                        .help("Stores hold uncompressed chunks"),
                )
                .arg(
                    Arg::with_name("encrypt")
                        .long("encrypt")
                        .value_name("CIPHER")
                        .possible_values(&["aes-256-ctr", "aes-256-gcm", "xchacha20-poly1305"])
                        .help("Stores hold encrypted chunks; passphrase read from $CASTR_PASSPHRASE"),
                )
                .arg(
                    Arg::with_name("http-retry-count")
                        .long("http-retry-count")
                        .value_name("COUNT")
                        .help("Retry failed http requests this many times [default: 0]"),
                )
                .arg(
                    Arg::with_name("http-retry-delay")
                        .long("http-retry-delay")
                        .value_name("SECONDS")
                        .help("Delay between http retries [default: 1]"),
                )
                .arg(
                    Arg::with_name("http-timeout")
                        .long("http-timeout")
                        .value_name("SECONDS")
                        .help("Timeout for http requests"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify-store")
                .about("Check every chunk of a local store against its id.")
                .arg(
                    Arg::with_name("STORE")
                        .value_name("STORE")
                        .help("Store directory")
                        .required(true),
                )
                .arg(
                    Arg::with_name("repair")
                        .long("repair")
                        .help("Delete corrupt chunks"),
                )
                .arg(
                    Arg::with_name("concurrency")
                        .short("n")
                        .long("concurrency")
                        .value_name("N")
                        .help("Number of workers [default: number of cores]"),
                )
                .arg(
                    Arg::with_name("uncompressed")
                        .long("uncompressed")
                        .help("Store holds uncompressed chunks"),
                )
                .arg(
                    Arg::with_name("encrypt")
                        .long("encrypt")
                        .value_name("CIPHER")
                        .possible_values(&["aes-256-ctr", "aes-256-gcm", "xchacha20-poly1305"])
                        .help("Store holds encrypted chunks; passphrase read from $CASTR_PASSPHRASE"),
                ),
        )
        .subcommand(
            SubCommand::with_name("chunk-server")
                .about("Serve a local store over stdin/stdout, for use behind ssh.")
                .arg(
                    Arg::with_name("STORE")
                        .value_name("STORE")
                        .help("Store directory")
                        .required(true),
                )
                .arg(
                    Arg::with_name("writable")
                        .short("w")
                        .long("writable")
                        .help("Accept pushed chunks"),
                ),
        )
        .get_matches();

    // Init logger
    pretty_env_logger::formatted_timed_builder()
        .filter(
            None,
            match matches.occurrences_of("verbose") {
                0 => log::LevelFilter::Info,
                1 => log::LevelFilter::Debug,
                _ => log::LevelFilter::Trace,
            },
        )
        .init();

    set_digest_algorithm(match matches.value_of("digest") {
        Some("sha256") => HashFunction::Sha256,
        _ => HashFunction::Sha512_256,
    });

    // One cancellation signal per invocation.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    if let Some(matches) = matches.subcommand_matches("make") {
        make_cmd::run(matches, &cancel).await?;
    } else if let Some(matches) = matches.subcommand_matches("extract") {
        extract_cmd::run(matches, &cancel).await?;
    } else if let Some(matches) = matches.subcommand_matches("verify-store") {
        verify_cmd::run(matches, &cancel).await?;
    } else if let Some(matches) = matches.subcommand_matches("chunk-server") {
        serve_cmd::run(matches, &cancel).await?;
    }
    Ok(())
}

/// Worker count from `-n`, defaulting to the number of cores.
pub fn concurrency_arg(matches: &clap::ArgMatches<'_>) -> Result<usize, castr::Error> {
    match matches.value_of("concurrency") {
        Some(value) => value
            .parse()
            .map_err(|_| castr::Error::ConfigInvalid("invalid worker count")),
        None => Ok(match num_cpus::get() {
            0 | 1 => 1,
            n => n,
        }),
    }
}

/// Converter stack from the shared `--uncompressed`/`--encrypt` flags.
pub fn converters_arg(matches: &clap::ArgMatches<'_>) -> Result<castr::Converters, castr::Error> {
    let mut layers = Vec::new();
    if !matches.is_present("uncompressed") {
        layers.push(castr::Converter::zstd());
    }
    if let Some(cipher) = matches.value_of("encrypt") {
        let passphrase = std::env::var("CASTR_PASSPHRASE").map_err(|_| {
            castr::Error::ConfigInvalid("--encrypt needs a passphrase in $CASTR_PASSPHRASE")
        })?;
        let key = castr::EncryptionKey::from_passphrase(&passphrase);
        layers.push(match cipher {
            "aes-256-ctr" => castr::Converter::Aes256Ctr { key },
            "aes-256-gcm" => castr::Converter::Aes256Gcm { key },
            _ => castr::Converter::XChaCha20Poly1305 { key },
        });
    }
    Ok(castr::Converters::new(layers))
}
