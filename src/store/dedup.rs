use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::chunk::Chunk;
use crate::error::Error;
use crate::hash::ChunkId;
use crate::store::Store;

type Flight<T> = Mutex<HashMap<ChunkId, watch::Receiver<Option<T>>>>;

/// Collapses concurrent identical requests into a single backend call.
///
/// For each of `get_chunk` and `has_chunk` a table of in-flight requests is
/// kept; the first caller for an ID performs the backend call and publishes
/// the result to every caller that arrived while it was running. Entries
/// are removed as soon as the backend call completes, so chunk bytes are
/// never retained beyond the last waiter.
pub struct DedupStore {
    store: Arc<dyn Store>,
    get_flight: Flight<Result<Chunk, Error>>,
    has_flight: Flight<Result<bool, Error>>,
}

impl DedupStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            get_flight: Mutex::new(HashMap::new()),
            has_flight: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Waiter(watch::Receiver<Option<T>>),
}

fn join_flight<T>(flight: &Flight<T>, id: &ChunkId) -> Role<T> {
    let mut map = flight.lock().unwrap();
    if let Some(rx) = map.get(id) {
        Role::Waiter(rx.clone())
    } else {
        let (tx, rx) = watch::channel(None);
        map.insert(*id, rx);
        Role::Leader(tx)
    }
}

/// Removes the in-flight entry when the leader finishes, even if its future
/// is dropped mid-call.
struct FlightGuard<'a, T> {
    flight: &'a Flight<T>,
    id: ChunkId,
}

impl<'a, T> Drop for FlightGuard<'a, T> {
    fn drop(&mut self) {
        self.flight.lock().unwrap().remove(&self.id);
    }
}

async fn wait_for<T: Clone>(mut rx: watch::Receiver<Option<T>>) -> Result<T, Error> {
    loop {
        {
            let value = rx.borrow_and_update();
            if let Some(result) = value.as_ref() {
                return Ok(result.clone());
            }
        }
        if rx.changed().await.is_err() {
            // The leader went away without publishing a result.
            return Err(Error::Interrupted);
        }
    }
}

#[async_trait]
impl Store for DedupStore {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        match join_flight(&self.get_flight, id) {
            Role::Leader(tx) => {
                let guard = FlightGuard {
                    flight: &self.get_flight,
                    id: *id,
                };
                let result = self.store.get_chunk(id).await;
                drop(guard);
                let _ = tx.send(Some(result.clone()));
                result
            }
            Role::Waiter(rx) => wait_for(rx).await?,
        }
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        match join_flight(&self.has_flight, id) {
            Role::Leader(tx) => {
                let guard = FlightGuard {
                    flight: &self.has_flight,
                    id: *id,
                };
                let result = self.store.has_chunk(id).await;
                drop(guard);
                let _ = tx.send(Some(result.clone()));
                result
            }
            Role::Waiter(rx) => wait_for(rx).await?,
        }
    }

    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error> {
        self.store.store_chunk(chunk).await
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        self.store.remove_chunk(id).await
    }

    fn name(&self) -> String {
        self.store.name()
    }
}
