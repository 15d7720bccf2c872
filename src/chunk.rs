use bytes::Bytes;

use crate::converter::Converters;
use crate::error::Error;
use crate::hash::ChunkId;

/// A chunk holding plain bytes, storage-form bytes, or both.
///
/// Conversion between forms and ID derivation are lazy; once the ID of a
/// non-trusted chunk has been computed, the plain bytes are known to match
/// it. A chunk created from storage with `skip_verify` trusts the asserted
/// ID and never hashes.
#[derive(Debug, Clone)]
pub struct Chunk {
    plain: Option<Bytes>,
    storage: Option<Bytes>,
    storage_converters: Converters,
    /// Verified or trusted identity.
    id: Option<ChunkId>,
    /// Identity claimed by the source but not checked yet.
    asserted: Option<ChunkId>,
}

impl Chunk {
    pub fn from_plain(data: impl Into<Bytes>) -> Self {
        Self {
            plain: Some(data.into()),
            storage: None,
            storage_converters: Converters::none(),
            id: None,
            asserted: None,
        }
    }

    /// Plain bytes with a known ID. Unless `skip_verify`, the bytes are
    /// hashed here and a mismatch is an error.
    pub fn from_plain_with_id(
        id: ChunkId,
        data: impl Into<Bytes>,
        skip_verify: bool,
    ) -> Result<Self, Error> {
        let data = data.into();
        if !skip_verify {
            let got = ChunkId::digest(&data);
            if got != id {
                return Err(Error::ChunkInvalid { expected: id, got });
            }
        }
        Ok(Self {
            plain: Some(data),
            storage: None,
            storage_converters: Converters::none(),
            id: Some(id),
            asserted: None,
        })
    }

    /// Storage-form bytes as read from a store. With `skip_verify` the
    /// asserted ID is trusted and returned unchecked; otherwise the first
    /// access to the plain bytes or the ID verifies it.
    pub fn from_storage(
        id: ChunkId,
        storage: impl Into<Bytes>,
        converters: Converters,
        skip_verify: bool,
    ) -> Self {
        Self {
            plain: None,
            storage: Some(storage.into()),
            storage_converters: converters,
            id: if skip_verify { Some(id) } else { None },
            asserted: if skip_verify { None } else { Some(id) },
        }
    }

    fn ensure_plain(&mut self) -> Result<(), Error> {
        if self.plain.is_none() {
            let storage = self
                .storage
                .as_ref()
                .ok_or_else(|| Error::invalid_format("chunk without data"))?;
            self.plain = Some(self.storage_converters.from_storage(storage)?.into());
        }
        if self.id.is_none() {
            if let (Some(expected), Some(plain)) = (self.asserted, self.plain.as_ref()) {
                let got = ChunkId::digest(plain);
                if got != expected {
                    return Err(Error::ChunkInvalid { expected, got });
                }
                self.id = Some(expected);
                self.asserted = None;
            }
        }
        Ok(())
    }

    /// Plain bytes, converting from storage form if necessary.
    pub fn data(&mut self) -> Result<&Bytes, Error> {
        self.ensure_plain()?;
        self.plain
            .as_ref()
            .ok_or_else(|| Error::invalid_format("chunk without data"))
    }

    /// Storage-form bytes under the given converter stack, converting from
    /// plain if the held storage form does not match.
    pub fn storage(&mut self, converters: &Converters) -> Result<Bytes, Error> {
        if let Some(storage) = &self.storage {
            if self.storage_converters == *converters {
                return Ok(storage.clone());
            }
        }
        let plain = self.data()?.clone();
        let storage = Bytes::from(converters.to_storage(&plain)?);
        self.storage = Some(storage.clone());
        self.storage_converters = converters.clone();
        Ok(storage)
    }

    /// Chunk identity; hashed and memoised on first call.
    pub fn id(&mut self) -> Result<ChunkId, Error> {
        if let Some(id) = self.id {
            return Ok(id);
        }
        self.ensure_plain()?;
        if let Some(id) = self.id {
            return Ok(id);
        }
        let id = match self.plain.as_ref() {
            Some(plain) => ChunkId::digest(plain),
            None => return Err(Error::invalid_format("chunk without data")),
        };
        self.id = Some(id);
        Ok(id)
    }
}

/// The chunk consisting of `max` zero bytes. Its ID is computed once per
/// run and used as a fast path by the chunkers and the null-chunk seed.
#[derive(Debug, Clone)]
pub struct NullChunk {
    pub id: ChunkId,
    pub data: Bytes,
}

impl NullChunk {
    pub fn new(max_size: u64) -> Self {
        let data = Bytes::from(vec![0u8; max_size as usize]);
        Self {
            id: ChunkId::digest(&data),
            data,
        }
    }
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{Converter, EncryptionKey};

    #[test]
    fn id_agrees_with_digest() {
        let data = b"chunk of bytes".to_vec();
        let id = ChunkId::digest(&data);
        assert!(Chunk::from_plain_with_id(id, data.clone(), false).is_ok());
        let other = ChunkId::digest(b"other");
        match Chunk::from_plain_with_id(other, data.clone(), false) {
            Err(Error::ChunkInvalid { expected, got }) => {
                assert_eq!(expected, other);
                assert_eq!(got, id);
            }
            other => panic!("unexpected {:?}", other),
        }
        // Trusted chunks keep the asserted id unchecked.
        let mut trusted = Chunk::from_plain_with_id(other, data, true).unwrap();
        assert_eq!(trusted.id().unwrap(), other);
    }

    #[test]
    fn storage_round_trip() {
        let stack = Converters::compressed();
        let data = vec![7u8; 4096];
        let id = ChunkId::digest(&data);
        let mut chunk = Chunk::from_plain(data.clone());
        let storage = chunk.storage(&stack).unwrap();
        assert!(storage.len() < data.len());

        let mut read_back = Chunk::from_storage(id, storage, stack.clone(), false);
        assert_eq!(&read_back.data().unwrap()[..], &data[..]);
        assert_eq!(read_back.id().unwrap(), id);
        // Same stack again returns the held storage bytes.
        let again = read_back.storage(&stack).unwrap();
        assert_eq!(again, chunk.storage(&stack).unwrap());
    }

    #[test]
    fn corrupt_storage_is_detected() {
        let stack = Converters::compressed();
        let data = vec![3u8; 1024];
        let id = ChunkId::digest(&data);
        let mut storage = stack.to_storage(&data).unwrap();
        let last = storage.len() - 1;
        storage[last] ^= 0xff;
        let mut chunk = Chunk::from_storage(id, storage, stack, false);
        assert!(chunk.data().is_err());
    }

    #[test]
    fn storage_conversion_between_stacks() {
        let key = EncryptionKey::from_passphrase("pw");
        let plain_stack = Converters::none();
        let crypt_stack = Converters::new(vec![Converter::zstd(), Converter::Aes256Gcm { key }]);
        let data = vec![42u8; 2048];
        let mut chunk = Chunk::from_plain(data.clone());
        let encrypted = chunk.storage(&crypt_stack).unwrap();
        assert_eq!(crypt_stack.from_storage(&encrypted).unwrap(), data);
        assert_eq!(&chunk.storage(&plain_stack).unwrap()[..], &data[..]);
    }

    #[test]
    fn null_chunk_identity() {
        let null = NullChunk::new(256 * 1024);
        assert_eq!(null.size(), 256 * 1024);
        assert_eq!(null.id, ChunkId::digest(&vec![0u8; 256 * 1024]));
    }
}
