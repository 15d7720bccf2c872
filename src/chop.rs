use futures_util::stream::{self, StreamExt};
use log::*;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::error::Error;
use crate::index::Index;
use crate::store::Store;

/// Cut the blob at `path` along `index` and store every chunk not already
/// present. Returns the number of chunks written.
pub async fn chop_blob(
    path: &Path,
    index: &Index,
    store: Arc<dyn Store>,
    n: usize,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let file = Arc::new(AsyncMutex::new(File::open(path).await?));
    let written: Vec<Result<u64, Error>> = stream::iter(index.chunks.iter().copied())
        .map(|chunk| {
            let file = file.clone();
            let store = store.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(Error::Interrupted);
                }
                if store.has_chunk(&chunk.id).await? {
                    return Ok(0);
                }
                let mut buf = vec![0u8; chunk.size as usize];
                {
                    let mut file = file.lock().await;
                    file.seek(SeekFrom::Start(chunk.start)).await?;
                    file.read_exact(&mut buf).await?;
                }
                // The hash check catches a blob that moved under a stale
                // index.
                let verified = Chunk::from_plain_with_id(chunk.id, buf, false)?;
                store.store_chunk(verified).await?;
                debug!("stored chunk {}", chunk.id);
                Ok(1)
            }
        })
        .buffer_unordered(n.max(1))
        .collect()
        .await;
    let mut total = 0;
    for result in written {
        total += result?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::tests::{random_data, test_config};
    use crate::parallel_chunker::index_from_path;
    use crate::store::MemStore;

    #[tokio::test]
    async fn chop_fills_the_store_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, random_data(800 * 1024, 21)).await.unwrap();
        let cancel = CancellationToken::new();
        let index = index_from_path(&path, &test_config(), 2, &cancel)
            .await
            .unwrap();

        let store = Arc::new(MemStore::new("mem"));
        let written = chop_blob(&path, &index, store.clone(), 4, &cancel)
            .await
            .unwrap();
        assert_eq!(written as usize, store.len());
        for chunk in &index.chunks {
            assert!(store.has_chunk(&chunk.id).await.unwrap());
        }

        // Second run stores nothing new.
        let written = chop_blob(&path, &index, store.clone(), 4, &cancel)
            .await
            .unwrap();
        assert_eq!(written, 0);
    }
}
