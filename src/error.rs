use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::hash::ChunkId;

/// Error type used throughout the crate.
///
/// The enum is `Clone` so that a single result can be fanned out to every
/// caller waiting on the same in-flight request; inner error types which are
/// not clonable are held behind `Arc`.
#[derive(Debug, Clone)]
pub enum Error {
    /// The requested chunk is not present in the queried store.
    ChunkMissing(ChunkId),
    /// A chunk's computed hash did not match its asserted ID.
    ChunkInvalid { expected: ChunkId, got: ChunkId },
    /// An index or stream violated a structural invariant.
    InvalidFormat(String),
    /// Chunker parameters are outside the allowed ordering.
    ConfigInvalid(&'static str),
    /// A seed's data no longer matches its index.
    SeedInvalid(PathBuf),
    /// Cancellation observed.
    Interrupted,
    /// Local file system error.
    Io(Arc<io::Error>),
    /// Back-end specific transport error.
    Transport(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn invalid_format<T: Into<String>>(detail: T) -> Self {
        Self::InvalidFormat(detail.into())
    }
    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Arc::new(err))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChunkMissing(id) => write!(f, "chunk {} missing from store", id),
            Self::ChunkInvalid { expected, got } => {
                write!(f, "chunk invalid (expected {}, got {})", expected, got)
            }
            Self::InvalidFormat(detail) => write!(f, "invalid format: {}", detail),
            Self::ConfigInvalid(detail) => write!(f, "invalid chunker config: {}", detail),
            Self::SeedInvalid(path) => write!(f, "seed {} no longer matches its index", path.display()),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Transport(err) => write!(f, "transport error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err.as_ref()),
            Self::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::transport(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::transport(err)
    }
}
