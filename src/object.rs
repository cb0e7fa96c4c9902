//! Single-object API for programs embedding gsg
//!
//! An [`ObjectClient`] owns a backend registry and a per-URL write limiter.
//! Each [`Object`] points at one remote URL and can be re-pointed with
//! [`Object::reset`]; writes to the same URL are held to one per second.

use crate::config::Config;
use crate::context::Registry;
use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::storage::ObjectStore;
use futures::StreamExt;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Writes allowed per URL per second
pub const WRITES_PER_SECOND: NonZeroU32 = NonZeroU32::MIN;

/// Opens [`Object`] handles; cheap to clone, clones share the write limiter
#[derive(Clone)]
pub struct ObjectClient {
    registry: Registry,
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
}

impl ObjectClient {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            limiter: Arc::new(RateLimiter::keyed(Quota::per_second(WRITES_PER_SECOND))),
        }
    }

    /// Client over the standard backends
    pub fn from_config(config: &Config) -> Self {
        Self::new(Registry::standard(config))
    }

    /// Handle for `url`; the backend client is initialised here, so missing
    /// credentials fail early
    pub async fn open(&self, url: &str) -> Result<Object> {
        let (locator, store) = self.resolve(url).await?;
        Ok(Object {
            client: self.clone(),
            locator,
            store,
        })
    }

    async fn resolve(&self, url: &str) -> Result<(Locator, Arc<dyn ObjectStore>)> {
        let locator = Locator::parse(url)?;
        if !locator.is_remote() {
            return Err(Error::InvalidLocator {
                locator: url.to_string(),
                reason: "object URLs must be scheme://bucket/key".to_string(),
            });
        }
        let store = self.registry.get(locator.scheme)?;
        store.init(&locator.bucket).await?;
        Ok((locator, store))
    }
}

/// One object found by [`Object::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub url: String,
    pub mod_time: Option<SystemTime>,
}

/// Handle on a single remote object
pub struct Object {
    client: ObjectClient,
    locator: Locator,
    store: Arc<dyn ObjectStore>,
}

impl Object {
    pub fn url(&self) -> String {
        self.locator.to_uri()
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Point this handle at another URL
    pub async fn reset(&mut self, url: &str) -> Result<()> {
        let (locator, store) = self.client.resolve(url).await?;
        self.locator = locator;
        self.store = store;
        Ok(())
    }

    /// Stream the object's contents into `to`, returning the bytes copied
    pub async fn read<W>(&self, to: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Locator { bucket, path, .. } = &self.locator;
        let attrs = self
            .store
            .attributes(bucket, path)
            .await?
            .ok_or_else(|| Error::not_found(self.url()))?;

        let mut copied = 0u64;
        if attrs.size > 0 {
            let mut stream = self.store.open_range(bucket, path, 0, attrs.size).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                to.write_all(&chunk)
                    .await
                    .map_err(|e| Error::io(format!("copying out {}", self.url()), e))?;
                copied += chunk.len() as u64;
            }
        }
        to.flush()
            .await
            .map_err(|e| Error::io(format!("copying out {}", self.url()), e))?;
        Ok(copied)
    }

    /// Replace the object with the contents of `from`
    pub async fn write<R>(&self, from: &mut R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let key = self.url();
        self.client.limiter.until_key_ready(&key).await;
        self.store
            .write(&self.locator.bucket, &self.locator.path, from)
            .await
    }

    pub async fn delete(&self) -> Result<()> {
        self.store
            .delete(&self.locator.bucket, &self.locator.path)
            .await
    }

    /// Objects at or under this URL; `NotFound` when there are none
    pub async fn list(&self, recursive: bool) -> Result<Vec<ObjectEntry>> {
        let resources = self
            .store
            .list(&self.locator.bucket, &self.locator.path, recursive)
            .await?;
        if resources.is_empty() {
            return Err(Error::not_found(self.url()));
        }

        Ok(resources
            .into_iter()
            .filter_map(|resource| {
                let mod_time = resource.attributes()?.mod_time;
                Some(ObjectEntry {
                    url: resource.locator.to_uri(),
                    mod_time,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_paths_are_rejected() {
        let client = ObjectClient::new(Registry::new());
        assert!(matches!(
            client.open("/tmp/some/file").await,
            Err(Error::InvalidLocator { .. })
        ));
    }

    #[tokio::test]
    async fn test_unregistered_backend_fails_on_open() {
        let client = ObjectClient::new(Registry::new());
        assert!(matches!(
            client.open("gs://bucket/key").await,
            Err(Error::Config { .. })
        ));
    }
}
