//! Storage backends for gsg
//!
//! Every backend implements [`ObjectStore`]. Backends that can host a
//! distributed lock also expose the narrower [`LockingStore`] through
//! [`ObjectStore::locking`].

pub mod gcs;
pub mod local;
pub mod r2;
pub mod s3;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator, Scheme};
use crate::types::{Attributes, DiskUsage, Resource, UsageTree};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use r2::r2_store;
pub use s3::S3Store;

/// Metadata key carrying the source file's modification time (unix nanos)
pub const MTIME_METADATA_KEY: &str = "goog-reserved-file-mtime";

/// Stream of bytes from a ranged read
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Uniform operations over a cloud bucket or the local filesystem
///
/// Paths are object keys for remote backends and absolute paths for the
/// local one, where `bucket` is ignored.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Scheme this backend serves
    fn scheme(&self) -> Scheme;

    /// Backend name for errors and logs
    fn name(&self) -> &'static str {
        self.scheme().backend_name()
    }

    /// Establish credentials and a client; idempotent
    async fn init(&self, bucket: &str) -> Result<()>;

    /// Attributes of the object at `path`, or `None` if there is none
    async fn attributes(&self, bucket: &str, path: &str) -> Result<Option<Attributes>>;

    /// Entries under a directory prefix (ending in '/', or empty for the root)
    ///
    /// Object attributes carry paths relative to `prefix`. Without
    /// `recursive`, sub-directories are returned as directory resources.
    async fn list_prefix(&self, bucket: &str, prefix: &str, recursive: bool)
        -> Result<Vec<Resource>>;

    /// Up to `limit` keys that start with `prefix`
    async fn peek_keys(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Delete one object
    async fn delete(&self, bucket: &str, path: &str) -> Result<()>;

    /// Copy an object within this backend
    async fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<()>;

    /// Read a whole object into memory
    async fn cat(&self, bucket: &str, path: &str) -> Result<Bytes>;

    /// Stream the byte range `[start, end)` of an object
    async fn open_range(&self, bucket: &str, path: &str, start: u64, end: u64)
        -> Result<ByteStream>;

    /// Upload a local file, embedding its modification time as metadata
    async fn upload(&self, ctx: &Context, src: &Path, bucket: &str, path: &str) -> Result<()>;

    /// Write an object from a reader, replacing whatever is at `path`
    ///
    /// The object's modification time is the time of the write.
    async fn write(
        &self,
        bucket: &str,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()>;

    /// Download an object to a local file through the chunked transfer engine
    async fn download(
        &self,
        ctx: &Context,
        bucket: &str,
        path: &str,
        dst: &Path,
        force_checksum: bool,
    ) -> Result<()>;

    /// Locking primitives, if this backend supports them
    fn locking(&self) -> Option<&dyn LockingStore> {
        None
    }

    /// True if an object exists at exactly `path`
    async fn is_object(&self, bucket: &str, path: &str) -> Result<bool> {
        Ok(self.attributes(bucket, path).await?.is_some())
    }

    /// True if `path` is a directory prefix with at least one entry below it
    async fn is_directory(&self, bucket: &str, path: &str) -> Result<bool> {
        let keys = self
            .peek_keys(bucket, &locator::as_directory(path), 2)
            .await?;
        Ok(is_directory_listing(path, &keys))
    }

    /// List `path`: a single object if one exists there, otherwise the
    /// entries under it as a directory prefix
    async fn list(&self, bucket: &str, path: &str, recursive: bool) -> Result<Vec<Resource>> {
        if !path.is_empty() && !path.ends_with('/') {
            if let Some(attrs) = self.attributes(bucket, path).await? {
                let attrs = attrs.with_relative_path(locator::file_name(path));
                let loc = Locator::remote(self.scheme(), bucket, path);
                return Ok(vec![Resource::object(loc, attrs)]);
            }
        }
        self.list_prefix(bucket, &locator::as_directory(path), recursive)
            .await
    }

    /// CRC32C of an object
    async fn checksum(&self, bucket: &str, path: &str) -> Result<u32> {
        match self.attributes(bucket, path).await? {
            Some(attrs) => attrs.checksum.value().await,
            None => Err(Error::not_found(path)),
        }
    }

    /// Per-node sizes under `path`, children before their parent directory
    async fn disk_usage(&self, bucket: &str, path: &str) -> Result<Vec<DiskUsage>> {
        if let Some(attrs) = self.attributes(bucket, path).await? {
            return Ok(vec![DiskUsage {
                name: path.to_string(),
                size: attrs.size,
            }]);
        }

        let mut tree = UsageTree::new(path);
        for resource in self.list(bucket, path, true).await? {
            if let Some(attrs) = resource.attributes() {
                tree.insert(&resource.locator.path, attrs.size);
            }
        }
        Ok(tree.flatten())
    }

    /// Move an object within this backend
    async fn move_object(
        &self,
        src_bucket: &str,
        src: &str,
        dst_bucket: &str,
        dst: &str,
    ) -> Result<()> {
        self.copy(src_bucket, src, dst_bucket, dst).await?;
        self.delete(src_bucket, src).await
    }
}

/// Directory rule over a peek of the keys under `path`: more than one entry,
/// or a single entry with a component beyond `path`
pub fn is_directory_listing(path: &str, keys: &[String]) -> bool {
    match keys {
        [] => false,
        [only] => only.len() > path.len(),
        _ => true,
    }
}

/// Fencing token returned by a conditional create
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockToken {
    /// Object generation, or a random value for the local backend
    Generation(u64),
    /// Entity tag
    ETag(String),
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockToken::Generation(g) => write!(f, "generation:{}", g),
            LockToken::ETag(e) => write!(f, "etag:{}", e),
        }
    }
}

impl FromStr for LockToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(g) = s.strip_prefix("generation:") {
            return g
                .parse()
                .map(LockToken::Generation)
                .map_err(|e| Error::config(format!("invalid lock token '{}': {}", s, e)));
        }
        if let Some(e) = s.strip_prefix("etag:") {
            return Ok(LockToken::ETag(e.to_string()));
        }
        Err(Error::config(format!("invalid lock token '{}'", s)))
    }
}

/// Observed state of an existing lock object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub token: LockToken,
    pub last_modified: SystemTime,
}

/// Conditional primitives the distributed lock is built on
#[async_trait]
pub trait LockingStore: Send + Sync {
    /// Create the object only if it does not exist; `None` if it already does
    async fn create_if_absent(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
    ) -> Result<Option<LockToken>>;

    /// Current token and modification time, or `None` if absent
    async fn lock_state(&self, bucket: &str, path: &str) -> Result<Option<LockState>>;

    /// Delete the object only if it still carries `token`
    async fn delete_if_matches(&self, bucket: &str, path: &str, token: &LockToken)
        -> Result<bool>;
}

/// Encode a modification time for object metadata
pub fn encode_mtime(mtime: SystemTime) -> String {
    mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
        .to_string()
}

/// Decode a modification time written by [`encode_mtime`]
pub fn decode_mtime(value: &str) -> Option<SystemTime> {
    let nanos: u128 = value.trim().parse().ok()?;
    let secs = u64::try_from(nanos / 1_000_000_000).ok()?;
    let sub = (nanos % 1_000_000_000) as u32;
    Some(UNIX_EPOCH + Duration::new(secs, sub))
}
