//! Chunk stores and their composition.

use async_trait::async_trait;
use log::*;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::chunk::Chunk;
use crate::converter::Converters;
use crate::error::Error;
use crate::hash::ChunkId;

mod dedup;
mod http;
mod local;
mod mem;

pub use dedup::DedupStore;
pub use http::HttpStore;
pub use local::{LocalStore, VerifyStats};
pub use mem::MemStore;

/// A chunk store back-end.
///
/// Implementations must be safe to share across workers; a missing chunk is
/// reported as `Error::ChunkMissing`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error>;
    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error>;
    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error>;
    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error>;
    fn name(&self) -> String;
}

/// Options common to the configurable store back-ends.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub converters: Converters,
    pub error_retry: u32,
    pub error_retry_delay: Duration,
    pub receive_timeout: Option<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            converters: Converters::compressed(),
            error_retry: 0,
            error_retry_delay: Duration::from_secs(1),
            receive_timeout: None,
        }
    }
}

/// Open a store from its location string: a `http(s)://` or `ssh://` URL,
/// or a local directory path.
pub async fn open_store(location: &str, opts: &StoreOptions) -> Result<Arc<dyn Store>, Error> {
    match location.parse::<Url>() {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            Ok(Arc::new(HttpStore::new(url, opts)?))
        }
        Ok(url) if url.scheme() == "ssh" => {
            Ok(Arc::new(crate::protocol::SshStore::connect(&url, opts).await?))
        }
        _ => Ok(Arc::new(
            LocalStore::new(location, opts.converters.clone()).await?,
        )),
    }
}

/// Queries a list of stores in order and returns the first hit.
pub struct StoreRouter {
    stores: Vec<Arc<dyn Store>>,
}

impl StoreRouter {
    pub fn new(stores: Vec<Arc<dyn Store>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl Store for StoreRouter {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        let last = self.stores.len().saturating_sub(1);
        for (i, store) in self.stores.iter().enumerate() {
            match store.get_chunk(id).await {
                Err(Error::ChunkMissing(_)) if i < last => continue,
                other => return other,
            }
        }
        Err(Error::ChunkMissing(*id))
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        for store in &self.stores {
            if store.has_chunk(id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error> {
        match self.stores.first() {
            Some(store) => store.store_chunk(chunk).await,
            None => Err(Error::invalid_format("no store configured")),
        }
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        match self.stores.first() {
            Some(store) => store.remove_chunk(id).await,
            None => Err(Error::ChunkMissing(*id)),
        }
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.stores.iter().map(|s| s.name()).collect();
        format!("router[{}]", names.join(","))
    }
}

/// A writable local store in front of a slower one, populated on miss.
pub struct CacheStore {
    remote: Arc<dyn Store>,
    local: Arc<dyn Store>,
}

impl CacheStore {
    pub fn new(remote: Arc<dyn Store>, local: Arc<dyn Store>) -> Self {
        Self { remote, local }
    }
}

#[async_trait]
impl Store for CacheStore {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        match self.local.get_chunk(id).await {
            Err(Error::ChunkMissing(_)) => {
                let chunk = self.remote.get_chunk(id).await?;
                if let Err(err) = self.local.store_chunk(chunk.clone()).await {
                    // The cache is an optimisation, a write failure is not.
                    warn!("failed to cache chunk {} in {}: {}", id, self.local.name(), err);
                }
                Ok(chunk)
            }
            other => other,
        }
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        if self.local.has_chunk(id).await? {
            return Ok(true);
        }
        self.remote.has_chunk(id).await
    }

    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error> {
        self.remote.store_chunk(chunk).await
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        match self.local.remove_chunk(id).await {
            Ok(()) | Err(Error::ChunkMissing(_)) => self.remote.remove_chunk(id).await,
            err => err,
        }
    }

    fn name(&self) -> String {
        format!("cache[{} -> {}]", self.remote.name(), self.local.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &[u8]) -> Chunk {
        Chunk::from_plain(data.to_vec())
    }

    #[tokio::test]
    async fn router_returns_first_hit() {
        let a = Arc::new(MemStore::new("a"));
        let b = Arc::new(MemStore::new("b"));
        let mut in_b = chunk(b"only in b");
        let id = in_b.id().unwrap();
        b.store_chunk(in_b).await.unwrap();

        let router = StoreRouter::new(vec![a.clone(), b.clone()]);
        let mut got = router.get_chunk(&id).await.unwrap();
        assert_eq!(&got.data().unwrap()[..], b"only in b");
        assert!(router.has_chunk(&id).await.unwrap());

        let missing = ChunkId::digest(b"nowhere");
        match router.get_chunk(&missing).await {
            Err(Error::ChunkMissing(m)) => assert_eq!(m, missing),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn cache_populates_on_miss() {
        let remote = Arc::new(MemStore::new("remote"));
        let local = Arc::new(MemStore::new("local"));
        let mut c = chunk(b"cached bytes");
        let id = c.id().unwrap();
        remote.store_chunk(c).await.unwrap();

        let cache = CacheStore::new(remote.clone(), local.clone());
        assert!(!local.has_chunk(&id).await.unwrap());
        let mut got = cache.get_chunk(&id).await.unwrap();
        assert_eq!(&got.data().unwrap()[..], b"cached bytes");
        // Second get is served from the local store.
        assert!(local.has_chunk(&id).await.unwrap());
        assert_eq!(remote.gets(), 1);
        cache.get_chunk(&id).await.unwrap();
        assert_eq!(remote.gets(), 1);
    }
}
