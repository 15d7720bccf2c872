use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::chunk::Chunk;
use crate::error::Error;
use crate::hash::ChunkId;
use crate::store::Store;

/// Store keeping plain chunk bytes in memory. Used as a cache backend and
/// as a test double; it counts its `get_chunk` calls and can simulate a
/// slow back-end.
#[derive(Default)]
pub struct MemStore {
    name: String,
    chunks: Mutex<HashMap<ChunkId, Bytes>>,
    gets: AtomicU64,
    delay: Option<Duration>,
}

impl MemStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Number of `get_chunk` calls that reached this store.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let data = self.chunks.lock().unwrap().get(id).cloned();
        match data {
            Some(data) => Ok(Chunk::from_plain_with_id(*id, data, true)?),
            None => Err(Error::ChunkMissing(*id)),
        }
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        Ok(self.chunks.lock().unwrap().contains_key(id))
    }

    async fn store_chunk(&self, mut chunk: Chunk) -> Result<(), Error> {
        let id = chunk.id()?;
        let data = chunk.data()?.clone();
        self.chunks.lock().unwrap().insert(id, data);
        Ok(())
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        match self.chunks.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::ChunkMissing(*id)),
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
