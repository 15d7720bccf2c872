use async_trait::async_trait;
use log::*;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use crate::chunk::Chunk;
use crate::converter::Converters;
use crate::error::Error;
use crate::hash::ChunkId;
use crate::store::{Store, StoreOptions};

/// Store reached over HTTP: `GET`/`HEAD`/`PUT <root>/<id[0..4]>/<id><ext>`.
///
/// A 404 maps to `ChunkMissing`; transient failures are retried up to the
/// configured budget with a fixed delay between attempts.
pub struct HttpStore {
    client: reqwest::Client,
    url: Url,
    converters: Converters,
    error_retry: u32,
    error_retry_delay: Duration,
}

impl HttpStore {
    pub fn new(url: Url, opts: &StoreOptions) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = opts.receive_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            url,
            converters: opts.converters.clone(),
            error_retry: opts.error_retry,
            error_retry_delay: opts.error_retry_delay,
        })
    }

    fn chunk_url(&self, id: &ChunkId) -> Result<Url, Error> {
        let hex = id.to_string();
        let mut base = self.url.clone();
        {
            let mut segments = base.path_segments_mut().map_err(|_| {
                Error::invalid_format(format!("store url {} cannot carry a path", self.url))
            })?;
            segments.pop_if_empty();
            segments.push(&hex[..4]);
            segments.push(&format!("{}{}", hex, self.converters.extension()));
        }
        Ok(base)
    }

    /// Run `request` with the configured retry budget. `Ok(None)` is a 404.
    async fn with_retries<F>(&self, what: &str, request: F) -> Result<Option<reqwest::Response>, Error>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let err: Error = match request().send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp) if resp.status().is_success() => return Ok(Some(resp)),
                Ok(resp) => Error::transport(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{} returned status {}", what, resp.status()),
                )),
                Err(err) => err.into(),
            };
            if attempt >= self.error_retry {
                return Err(err);
            }
            attempt += 1;
            debug!("{} failed ({}), retry {}/{}", what, err, attempt, self.error_retry);
            tokio::time::sleep(self.error_retry_delay).await;
        }
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn get_chunk(&self, id: &ChunkId) -> Result<Chunk, Error> {
        let url = self.chunk_url(id)?;
        let resp = self
            .with_retries("chunk get", || self.client.get(url.clone()))
            .await?
            .ok_or(Error::ChunkMissing(*id))?;
        let storage = resp.bytes().await?;
        Ok(Chunk::from_storage(
            *id,
            storage,
            self.converters.clone(),
            false,
        ))
    }

    async fn has_chunk(&self, id: &ChunkId) -> Result<bool, Error> {
        let url = self.chunk_url(id)?;
        Ok(self
            .with_retries("chunk head", || self.client.head(url.clone()))
            .await?
            .is_some())
    }

    async fn store_chunk(&self, mut chunk: Chunk) -> Result<(), Error> {
        let id = chunk.id()?;
        let url = self.chunk_url(&id)?;
        let storage = chunk.storage(&self.converters)?;
        // Unlike the read path, a 404 on a put is not a missing chunk;
        // every non-success status is a transport failure.
        let mut attempt = 0u32;
        loop {
            let err: Error = match self
                .client
                .put(url.clone())
                .body(storage.clone())
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => Error::transport(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("chunk put returned status {}", resp.status()),
                )),
                Err(err) => err.into(),
            };
            if attempt >= self.error_retry {
                return Err(err);
            }
            attempt += 1;
            debug!(
                "chunk put failed ({}), retry {}/{}",
                err, attempt, self.error_retry
            );
            tokio::time::sleep(self.error_retry_delay).await;
        }
    }

    async fn remove_chunk(&self, _id: &ChunkId) -> Result<(), Error> {
        Err(Error::transport(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "http store does not support chunk removal",
        )))
    }

    fn name(&self) -> String {
        self.url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_urls_use_fanout_and_extension() {
        let store = HttpStore::new(
            "http://example.com/store".parse().unwrap(),
            &StoreOptions::default(),
        )
        .unwrap();
        let id = ChunkId::digest(b"x");
        let hex = id.to_string();
        assert_eq!(
            store.chunk_url(&id).unwrap().as_str(),
            format!("http://example.com/store/{}/{}.cacnk", &hex[..4], hex)
        );
        // Trailing slash on the base does not double up.
        let store = HttpStore::new(
            "http://example.com/store/".parse().unwrap(),
            &StoreOptions::default(),
        )
        .unwrap();
        assert_eq!(
            store.chunk_url(&id).unwrap().as_str(),
            format!("http://example.com/store/{}/{}.cacnk", &hex[..4], hex)
        );
    }
}
