//! Distributed lock over conditional create/delete
//!
//! One storage object per lock. Acquire creates it only if absent; an
//! existing object older than the TTL is considered abandoned and is deleted
//! by its observed token before a single retry. Release deletes only if the
//! object still carries the token we hold.

use crate::error::{Error, Result};
use crate::locator::Locator;
use crate::storage::{encode_mtime, LockToken, LockingStore, ObjectStore};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio_util::sync::CancellationToken;

/// Interval between acquire attempts in [`DistributedLock::lock`]
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A lock on one object of a backend
pub struct DistributedLock {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    path: String,
    token: Option<LockToken>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            path: path.into(),
            token: None,
        }
    }

    /// Resume a lock acquired earlier, e.g. by another invocation
    pub fn with_token(mut self, token: LockToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Token of the held lock
    pub fn token(&self) -> Option<&LockToken> {
        self.token.as_ref()
    }

    fn locking(&self) -> Result<&dyn LockingStore> {
        self.store.locking().ok_or(Error::Unsupported {
            operation: "lock",
            backend: self.store.name(),
        })
    }

    fn conflict(&self) -> Error {
        Error::LockConflict {
            path: self.path.clone(),
        }
    }

    fn body() -> Bytes {
        Bytes::from(format!(
            "pid={} acquired={}\n",
            std::process::id(),
            encode_mtime(SystemTime::now())
        ))
    }

    /// One acquire attempt, reclaiming an expired lock at most once
    pub async fn try_acquire(&mut self, ttl: Duration) -> Result<LockToken> {
        let locking = self.locking()?;

        if let Some(token) = locking
            .create_if_absent(&self.bucket, &self.path, Self::body())
            .await?
        {
            tracing::debug!(path = %self.path, token = %token, "Lock acquired");
            self.token = Some(token.clone());
            return Ok(token);
        }

        match locking.lock_state(&self.bucket, &self.path).await? {
            // Released between our create and this read
            None => {}
            Some(state) if is_expired(state.last_modified, ttl) => {
                let reclaimed = locking
                    .delete_if_matches(&self.bucket, &self.path, &state.token)
                    .await?;
                tracing::info!(
                    path = %self.path,
                    token = %state.token,
                    reclaimed,
                    "Lock expired, reclaiming"
                );
            }
            Some(_) => return Err(self.conflict()),
        }

        match locking
            .create_if_absent(&self.bucket, &self.path, Self::body())
            .await?
        {
            Some(token) => {
                tracing::debug!(path = %self.path, token = %token, "Lock acquired after reclaim");
                self.token = Some(token.clone());
                Ok(token)
            }
            None => Err(self.conflict()),
        }
    }

    /// Poll [`DistributedLock::try_acquire`] every second until it succeeds
    /// or `cancel` fires
    pub async fn lock(&mut self, ttl: Duration, cancel: &CancellationToken) -> Result<LockToken> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(path = %self.path, "Lock wait cancelled");
                    return Err(Error::Cancelled);
                }
                _ = ticker.tick() => {
                    match self.try_acquire(ttl).await {
                        Ok(token) => return Ok(token),
                        Err(Error::LockConflict { .. }) => {
                            tracing::trace!(path = %self.path, "Lock busy, waiting");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Release the lock if we still own it
    ///
    /// If the object now carries another token the lock has been reclaimed by
    /// someone else; it is left alone and this returns `Ok`.
    pub async fn unlock(&mut self) -> Result<()> {
        let Some(token) = self.token.take() else {
            return Err(Error::LockTokenMismatch {
                path: self.path.clone(),
                reason: "no lock token held".to_string(),
            });
        };

        if self
            .locking()?
            .delete_if_matches(&self.bucket, &self.path, &token)
            .await?
        {
            tracing::debug!(path = %self.path, token = %token, "Lock released");
        } else {
            tracing::warn!(
                path = %self.path,
                token = %token,
                "Lock is no longer ours; leaving it in place"
            );
        }
        Ok(())
    }
}

fn is_expired(last_modified: SystemTime, ttl: Duration) -> bool {
    SystemTime::now()
        .duration_since(last_modified)
        .map(|age| age > ttl)
        .unwrap_or(false)
}

/// Tokens of held locks, kept on disk between `lock` and `unlock` runs
#[derive(Debug, Clone)]
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            dir: cache_root.join("locks"),
        }
    }

    fn entry(&self, locator: &Locator) -> PathBuf {
        let mut hasher = blake3::Hasher::new();
        hasher.update(locator.scheme.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(locator.bucket.as_bytes());
        hasher.update(b"|");
        hasher.update(locator.path.as_bytes());
        self.dir.join(hasher.finalize().to_hex().as_str())
    }

    pub async fn store(&self, locator: &Locator, token: &LockToken) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", self.dir.display()), e))?;
        let entry = self.entry(locator);
        fs::write(&entry, format!("{}\n", token))
            .await
            .map_err(|e| Error::io(format!("writing {}", entry.display()), e))
    }

    pub async fn load(&self, locator: &Locator) -> Result<Option<LockToken>> {
        let entry = self.entry(locator);
        match fs::read_to_string(&entry).await {
            Ok(contents) => contents.parse().map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("reading {}", entry.display()), e)),
        }
    }

    pub async fn remove(&self, locator: &Locator) -> Result<()> {
        let entry = self.entry(locator);
        match fs::remove_file(&entry).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("removing {}", entry.display()), e)),
        }
    }
}
