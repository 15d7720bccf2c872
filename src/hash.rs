use std::sync::atomic::{AtomicU8, Ordering};

use sha2::{Digest, Sha256, Sha512_256};

use crate::error::Error;
use crate::index::{CA_FORMAT_SHA256, CA_FORMAT_SHA512_256};

/// Number of bytes in a chunk identifier.
pub const CHUNK_ID_LEN: usize = 32;

/// Digest algorithm used for chunk identity.
///
/// The choice is global to a run; it is set once at startup and recorded in
/// the index feature flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunction {
    Sha512_256,
    Sha256,
}

static DIGEST_ALGORITHM: AtomicU8 = AtomicU8::new(0);

/// Select the process-wide digest algorithm. Call before any chunk ID is
/// derived; later calls affect subsequently computed IDs only.
pub fn set_digest_algorithm(hash: HashFunction) {
    let v = match hash {
        HashFunction::Sha512_256 => 0,
        HashFunction::Sha256 => 1,
    };
    DIGEST_ALGORITHM.store(v, Ordering::Relaxed);
}

/// The currently selected digest algorithm.
pub fn digest_algorithm() -> HashFunction {
    match DIGEST_ALGORITHM.load(Ordering::Relaxed) {
        0 => HashFunction::Sha512_256,
        _ => HashFunction::Sha256,
    }
}

impl HashFunction {
    pub fn digest(self, data: &[u8]) -> ChunkId {
        let mut id = [0u8; CHUNK_ID_LEN];
        match self {
            HashFunction::Sha512_256 => {
                let mut hasher = Sha512_256::new();
                hasher.update(data);
                id.copy_from_slice(&hasher.finalize());
            }
            HashFunction::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                id.copy_from_slice(&hasher.finalize());
            }
        }
        ChunkId(id)
    }
    /// Index feature flag bit announcing this algorithm.
    pub fn feature_flag(self) -> u64 {
        match self {
            HashFunction::Sha512_256 => CA_FORMAT_SHA512_256,
            HashFunction::Sha256 => CA_FORMAT_SHA256,
        }
    }
    /// Derive the algorithm from index feature flags.
    pub fn from_feature_flags(flags: u64) -> Result<HashFunction, Error> {
        if flags & CA_FORMAT_SHA512_256 != 0 {
            Ok(HashFunction::Sha512_256)
        } else if flags & CA_FORMAT_SHA256 != 0 {
            Ok(HashFunction::Sha256)
        } else {
            Err(Error::invalid_format(format!(
                "no known digest algorithm in feature flags {:#018x}",
                flags
            )))
        }
    }
}

/// Identity of a chunk: the cryptographic digest of its plain bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId([u8; CHUNK_ID_LEN]);

impl ChunkId {
    /// Digest `data` with the process-wide algorithm.
    pub fn digest(data: &[u8]) -> Self {
        digest_algorithm().digest(data)
    }
    pub fn from_slice(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() != CHUNK_ID_LEN {
            return Err(Error::invalid_format(format!(
                "invalid chunk id length {}",
                slice.len()
            )));
        }
        let mut id = [0u8; CHUNK_ID_LEN];
        id.copy_from_slice(slice);
        Ok(Self(id))
    }
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != CHUNK_ID_LEN * 2 {
            return Err(Error::invalid_format(format!("invalid chunk id '{}'", s)));
        }
        let mut id = [0u8; CHUNK_ID_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::invalid_format(format!("invalid chunk id '{}'", s)))?;
        }
        Ok(Self(id))
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{:02x}", b))
    }
}

impl std::fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_matches_digest_of_plain_bytes() {
        let id = HashFunction::Sha512_256.digest(b"hello");
        assert_eq!(id, HashFunction::Sha512_256.digest(b"hello"));
        assert_ne!(id, HashFunction::Sha512_256.digest(b"hello!"));
        assert_ne!(id, HashFunction::Sha256.digest(b"hello"));
    }

    #[test]
    fn hex_round_trip() {
        let id = HashFunction::Sha512_256.digest(b"abc");
        let hex = format!("{}", id);
        assert_eq!(hex.len(), 64);
        assert_eq!(ChunkId::from_hex(&hex).unwrap(), id);
        assert!(ChunkId::from_hex("zz").is_err());
    }

    #[test]
    fn feature_flag_round_trip() {
        for hash in [HashFunction::Sha512_256, HashFunction::Sha256] {
            assert_eq!(
                HashFunction::from_feature_flags(hash.feature_flag()).unwrap(),
                hash
            );
        }
        assert!(HashFunction::from_feature_flags(0).is_err());
    }
}
