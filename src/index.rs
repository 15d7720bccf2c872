//! In-memory index and its on-disk codec.
//!
//! The wire format is the casync index layout: a 48-byte index record,
//! a table record of cumulative-end items and a 40-byte tail whose leading
//! zero offset doubles as the item terminator. Little-endian throughout.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunker::ChunkerConfig;
use crate::error::Error;
use crate::hash::{ChunkId, HashFunction, CHUNK_ID_LEN};

pub const CA_FORMAT_INDEX: u64 = 0x9682_4d9c_7b12_9ff9;
pub const CA_FORMAT_TABLE: u64 = 0xe75b_9e11_2f17_417d;
pub const CA_FORMAT_TABLE_TAIL_MARKER: u64 = 0x4b4f_050e_5549_ecd1;
pub const CA_FORMAT_SHA512_256: u64 = 0x2000_0000_0000_0000;
pub const CA_FORMAT_SHA256: u64 = 0x4000_0000_0000_0000;

const INDEX_HEADER_SIZE: u64 = 48;
const TABLE_HEADER_SIZE: u64 = 16;
const TABLE_ITEM_SIZE: u64 = 40;

/// One chunk of an index: identity plus its place in the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexChunk {
    pub id: ChunkId,
    pub start: u64,
    pub size: u64,
}

impl IndexChunk {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Ordered list of chunk identities with their offsets, plus the chunker
/// parameters the blob was split with.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub feature_flags: u64,
    pub config: ChunkerConfig,
    pub chunks: Vec<IndexChunk>,
}

impl Index {
    pub fn new(config: ChunkerConfig, hash: HashFunction) -> Self {
        Self::from_chunks(config, hash, Vec::new())
    }

    pub fn from_chunks(config: ChunkerConfig, hash: HashFunction, chunks: Vec<IndexChunk>) -> Self {
        Self {
            feature_flags: hash.feature_flag(),
            config,
            chunks,
        }
    }

    /// Digest algorithm recorded in the feature flags.
    pub fn digest_algorithm(&self) -> Result<HashFunction, Error> {
        HashFunction::from_feature_flags(self.feature_flags)
    }

    /// Length in bytes of the reconstructed blob.
    pub fn length(&self) -> u64 {
        self.chunks.last().map(|c| c.end()).unwrap_or(0)
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut r = Cursor::new(data);
        let size = read_u64(&mut r)?;
        let kind = read_u64(&mut r)?;
        if size != INDEX_HEADER_SIZE || kind != CA_FORMAT_INDEX {
            return Err(Error::invalid_format("not an index file"));
        }
        let feature_flags = read_u64(&mut r)?;
        HashFunction::from_feature_flags(feature_flags)?;
        let min = read_u64(&mut r)?;
        let avg = read_u64(&mut r)?;
        let max = read_u64(&mut r)?;
        let config = ChunkerConfig::new(min, avg, max)?;

        let table_size = read_u64(&mut r)?;
        let table_kind = read_u64(&mut r)?;
        if table_size != u64::MAX || table_kind != CA_FORMAT_TABLE {
            return Err(Error::invalid_format("index table header missing"));
        }

        let mut chunks: Vec<IndexChunk> = Vec::new();
        let mut pos = 0u64;
        loop {
            let offset = read_u64(&mut r)?;
            if offset == 0 {
                // Table tail; the zero offset is the item terminator.
                let zero_fill2 = read_u64(&mut r)?;
                let index_offset = read_u64(&mut r)?;
                let tail_table_size = read_u64(&mut r)?;
                let marker = read_u64(&mut r)?;
                if zero_fill2 != 0
                    || index_offset != INDEX_HEADER_SIZE
                    || marker != CA_FORMAT_TABLE_TAIL_MARKER
                {
                    return Err(Error::invalid_format("corrupt index table tail"));
                }
                let expected =
                    TABLE_HEADER_SIZE + TABLE_ITEM_SIZE * (chunks.len() as u64 + 1);
                if tail_table_size != expected {
                    return Err(Error::invalid_format("index table size mismatch"));
                }
                break;
            }
            let mut id = [0u8; CHUNK_ID_LEN];
            std::io::Read::read_exact(&mut r, &mut id)
                .map_err(|_| Error::invalid_format("truncated index"))?;
            if offset <= pos {
                return Err(Error::invalid_format("index offsets not increasing"));
            }
            let chunk_size = offset - pos;
            if chunk_size > config.max_size {
                return Err(Error::invalid_format(format!(
                    "chunk size {} exceeds maximum {}",
                    chunk_size, config.max_size
                )));
            }
            chunks.push(IndexChunk {
                id: ChunkId::from_slice(&id)?,
                start: pos,
                size: chunk_size,
            });
            pos = offset;
        }
        Ok(Self {
            feature_flags,
            config,
            chunks,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let table_size = TABLE_HEADER_SIZE + TABLE_ITEM_SIZE * (self.chunks.len() as u64 + 1);
        let mut w =
            Vec::with_capacity((INDEX_HEADER_SIZE + table_size) as usize);
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, INDEX_HEADER_SIZE)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, CA_FORMAT_INDEX)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, self.feature_flags)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, self.config.min_size)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, self.config.avg_size)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, self.config.max_size)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, u64::MAX)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, CA_FORMAT_TABLE)?;
        for chunk in &self.chunks {
            WriteBytesExt::write_u64::<LittleEndian>(&mut w, chunk.end())?;
            std::io::Write::write_all(&mut w, chunk.id.as_slice())?;
        }
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, 0)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, 0)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, INDEX_HEADER_SIZE)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, table_size)?;
        WriteBytesExt::write_u64::<LittleEndian>(&mut w, CA_FORMAT_TABLE_TAIL_MARKER)?;
        Ok(w)
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        Self::decode(&data)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()?).await?;
        Ok(())
    }

    pub async fn from_path(path: &Path) -> Result<Self, Error> {
        let data = tokio::fs::read(path).await?;
        Self::decode(&data)
    }

    pub async fn to_path(&self, path: &Path) -> Result<(), Error> {
        tokio::fs::write(path, self.encode()?).await?;
        Ok(())
    }
}

fn read_u64(r: &mut Cursor<&[u8]>) -> Result<u64, Error> {
    ReadBytesExt::read_u64::<LittleEndian>(r)
        .map_err(|_| Error::invalid_format("truncated index"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashFunction;

    fn sample_index() -> Index {
        let config = ChunkerConfig::new(16 * 1024, 64 * 1024, 256 * 1024).unwrap();
        let sizes = [70_000u64, 16_384, 256 * 1024, 333];
        let mut chunks = Vec::new();
        let mut start = 0;
        for (i, size) in sizes.iter().enumerate() {
            chunks.push(IndexChunk {
                id: HashFunction::Sha512_256.digest(&[i as u8]),
                start,
                size: *size,
            });
            start += size;
        }
        Index::from_chunks(config, HashFunction::Sha512_256, chunks)
    }

    #[test]
    fn codec_round_trip_is_bit_exact() {
        let index = sample_index();
        let encoded = index.encode().unwrap();
        let decoded = Index::decode(&encoded).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.encode().unwrap(), encoded);
        assert_eq!(index.length(), 70_000 + 16_384 + 256 * 1024 + 333);
    }

    #[test]
    fn empty_index_round_trips() {
        let index = Index::new(ChunkerConfig::default(), HashFunction::Sha512_256);
        let decoded = Index::decode(&index.encode().unwrap()).unwrap();
        assert_eq!(decoded.length(), 0);
        assert_eq!(decoded.total_chunks(), 0);
    }

    #[test]
    fn rejects_foreign_and_corrupt_headers() {
        let index = sample_index();
        let mut encoded = index.encode().unwrap();
        assert!(Index::decode(&encoded[..40]).is_err());
        // Wrong record type.
        encoded[8] ^= 0xff;
        assert!(Index::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_non_increasing_offsets() {
        let index = sample_index();
        let mut encoded = index.encode().unwrap();
        // Second item offset equals the first one.
        let first = encoded[64..72].to_vec();
        encoded[104..112].copy_from_slice(&first);
        assert!(Index::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_chunk_larger_than_max() {
        let config = ChunkerConfig::new(16 * 1024, 64 * 1024, 256 * 1024).unwrap();
        let chunks = vec![IndexChunk {
            id: HashFunction::Sha512_256.digest(b"x"),
            start: 0,
            size: 256 * 1024 + 1,
        }];
        let index = Index::from_chunks(config, HashFunction::Sha512_256, chunks);
        let encoded = index.encode().unwrap();
        match Index::decode(&encoded) {
            Err(Error::InvalidFormat(detail)) => assert!(detail.contains("exceeds")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_tail_marker() {
        let index = sample_index();
        let mut encoded = index.encode().unwrap();
        let len = encoded.len();
        encoded[len - 1] ^= 0xff;
        assert!(Index::decode(&encoded).is_err());
    }

    #[test]
    fn requires_known_digest_flag() {
        let mut index = sample_index();
        index.feature_flags = 0;
        assert!(Index::decode(&index.encode().unwrap()).is_err());
    }
}
