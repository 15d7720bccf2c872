use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use log::*;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::converter::Converters;
use crate::error::Error;
use crate::hash::ChunkId;
use crate::store::Store;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Store backed by a local directory.
///
/// A chunk with hex id `XYZZ...` lives at `<root>/XYZZ/XYZZ...<ext>` where
/// `<ext>` is the concatenated converter extension. Writes go through a
/// temporary file and a rename.
pub struct LocalStore {
    root: PathBuf,
    converters: Converters,
}

impl LocalStore {
    pub async fn new(root: impl Into<PathBuf>, converters: Converters) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root, converters })
    }

    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_string();
        self.root
            .join(&hex[..4])
            .join(format!("{}{}", hex, self.converters.extension()))
    }

    /// Chunk ID encoded in a store file name, if it is one.
    fn id_from_file_name(&self, name: &str) -> Option<ChunkId> {
        let hex = name.strip_suffix(&self.converters.extension())?;
        ChunkId::from_hex(hex).ok()
    }

    /// Verify every chunk in the store against its file name. Corrupt
    /// chunks are counted and, with `repair`, deleted.
    pub async fn verify(
        &self,
        n: usize,
        repair: bool,
        cancel: &CancellationToken,
    ) -> Result<VerifyStats, Error> {
        let mut paths = Vec::new();
        let mut subdirs = fs::read_dir(&self.root).await?;
        while let Some(subdir) = subdirs.next_entry().await? {
            if !subdir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(subdir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                paths.push(entry.path());
            }
        }

        let stats = Arc::new(VerifyCounters::default());
        stream::iter(paths)
            .map(|path| {
                let stats = stats.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(Error::Interrupted);
                    }
                    self.verify_one(&path, repair, &stats).await
                }
            })
            .buffer_unordered(n.max(1))
            .collect::<Vec<Result<(), Error>>>()
            .await
            .into_iter()
            .collect::<Result<(), Error>>()?;

        Ok(VerifyStats {
            chunks: stats.chunks.load(Ordering::Relaxed),
            corrupt: stats.corrupt.load(Ordering::Relaxed),
            removed: stats.removed.load(Ordering::Relaxed),
        })
    }

    async fn verify_one(
        &self,
        path: &Path,
        repair: bool,
        stats: &VerifyCounters,
    ) -> Result<(), Error> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return Ok(()),
        };
        let id = match self.id_from_file_name(name) {
            Some(id) => id,
            None => {
                debug!("skipping non-chunk file {}", path.display());
                return Ok(());
            }
        };
        stats.chunks.fetch_add(1, Ordering::Relaxed);
        let storage = fs::read(path).await?;
        let mut chunk = Chunk::from_storage(id, storage, self.converters.clone(), false);
        match chunk.data() {
            Ok(_) => Ok(()),
            Err(Error::ChunkInvalid { .. }) | Err(Error::InvalidFormat(_)) | Err(Error::Io(_)) => {
                stats.corrupt.fetch_add(1, Ordering::Relaxed);
                warn!("chunk {} corrupt in {}", id, self.root.display());
                if repair {
                    fs::remove_file(path).await?;
                    stats.removed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Default)]
struct VerifyCounters {
    chunks: AtomicU64,
    corrupt: AtomicU64,
    removed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyStats {
    pub chunks: u64,
    pub corrupt: u64,
    pub removed: u64,
}

#[async_trait]
impl Store for LocalStore {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        match fs::read(self.chunk_path(id)).await {
            Ok(storage) => Ok(Chunk::from_storage(
                *id,
                storage,
                self.converters.clone(),
                false,
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::ChunkMissing(*id)),
            Err(err) => Err(err.into()),
        }
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        match fs::metadata(self.chunk_path(id)).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn store_chunk(&self, mut chunk: Chunk) -> Result<(), Error> {
        let id = chunk.id()?;
        let path = self.chunk_path(&id);
        if fs::metadata(&path).await.is_ok() {
            return Ok(());
        }
        let storage = chunk.storage(&self.converters)?;
        let dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => self.root.clone(),
        };
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(
            ".{}.tmp-{}-{}",
            id,
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, &storage).await?;
        fs::rename(&tmp, &path).await?;
        debug!("stored chunk {} at {}", id, path.display());
        Ok(())
    }

    async fn remove_chunk(&self, id: &ChunkId) -> Result<(), Error> {
        match fs::remove_file(self.chunk_path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::ChunkMissing(*id)),
            Err(err) => Err(err.into()),
        }
    }

    fn name(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(data: &[&[u8]]) -> (tempfile::TempDir, LocalStore, Vec<ChunkId>) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), Converters::compressed())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for d in data {
            let mut chunk = Chunk::from_plain(d.to_vec());
            ids.push(chunk.id().unwrap());
            store.store_chunk(chunk).await.unwrap();
        }
        (dir, store, ids)
    }

    #[tokio::test]
    async fn store_get_has_remove() {
        let (_dir, store, ids) = store_with(&[&b"first"[..], &b"second"[..]]).await;
        assert!(store.has_chunk(&ids[0]).await.unwrap());
        let mut chunk = store.get_chunk(&ids[0]).await.unwrap();
        assert_eq!(&chunk.data().unwrap()[..], b"first");

        store.remove_chunk(&ids[0]).await.unwrap();
        assert!(!store.has_chunk(&ids[0]).await.unwrap());
        assert!(matches!(
            store.get_chunk(&ids[0]).await,
            Err(Error::ChunkMissing(_))
        ));
        assert!(matches!(
            store.remove_chunk(&ids[0]).await,
            Err(Error::ChunkMissing(_))
        ));
    }

    #[tokio::test]
    async fn chunk_files_use_fanout_and_extension() {
        let (dir, store, ids) = store_with(&[&b"payload"[..]]).await;
        let hex = ids[0].to_string();
        let path = dir
            .path()
            .join(&hex[..4])
            .join(format!("{}.cacnk", hex));
        assert!(path.exists());
        assert_eq!(store.chunk_path(&ids[0]), path);
    }

    #[tokio::test]
    async fn verify_detects_and_repairs_corruption() {
        let (_dir, store, ids) = store_with(&[&b"one"[..], &b"two"[..], &b"three"[..]]).await;
        let cancel = CancellationToken::new();
        let stats = store.verify(2, false, &cancel).await.unwrap();
        assert_eq!(stats, VerifyStats { chunks: 3, corrupt: 0, removed: 0 });

        // Truncate one chunk file.
        let victim = store.chunk_path(&ids[1]);
        std::fs::write(&victim, b"garbage").unwrap();
        let stats = store.verify(2, true, &cancel).await.unwrap();
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.corrupt, 1);
        assert_eq!(stats.removed, 1);
        assert!(!store.has_chunk(&ids[1]).await.unwrap());
    }
}
