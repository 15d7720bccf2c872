//! Content-addressed chunk store client.
//!
//! Blobs are split by a rolling-hash chunker into variable-size chunks,
//! named by the digest of their plain bytes and listed in an index file.
//! The extractor rebuilds a blob from an index, preferring local seeds
//! (other blobs, the all-zero chunk, its own partial output) over store
//! round trips, with best-effort block cloning.

pub mod chop;
pub mod chunk;
pub mod chunker;
pub mod converter;
pub mod error;
pub mod extract;
pub mod hash;
pub mod index;
pub mod parallel_chunker;
pub mod protocol;
pub mod reflink;
pub mod rolling_hash;
pub mod seed;
pub mod sequencer;
pub mod size_str;
pub mod store;

pub use chop::chop_blob;
pub use chunk::{Chunk, NullChunk};
pub use chunker::{Chunker, ChunkerConfig};
pub use converter::{Converter, Converters, EncryptionKey};
pub use error::Error;
pub use extract::{extract, ExtractOptions, ExtractStats};
pub use hash::{digest_algorithm, set_digest_algorithm, ChunkId, HashFunction};
pub use index::{Index, IndexChunk};
pub use parallel_chunker::index_from_path;
pub use seed::{FileSeed, InvalidSeedAction, Seed};
pub use sequencer::{IndexSegment, SeedSequencer};
pub use store::{
    open_store, CacheStore, DedupStore, HttpStore, LocalStore, MemStore, Store, StoreOptions,
    StoreRouter,
};
