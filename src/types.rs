//! Core data types: attributes, resources and disk usage

use crate::error::Result;
use crate::locator::{self, Locator};
use crate::storage::ObjectStore;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;

type ComputeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<u32>> + Send + Sync>;

/// CRC32C of an object, either known up front or computed once on demand
#[derive(Clone)]
pub struct Checksum {
    cell: Arc<OnceCell<u32>>,
    compute: Option<ComputeFn>,
}

impl Checksum {
    /// A checksum the backend already reported
    pub fn known(value: u32) -> Self {
        Self {
            cell: Arc::new(OnceCell::new_with(Some(value))),
            compute: None,
        }
    }

    /// A checksum computed on first use and cached afterwards
    pub fn lazy<F, Fut>(compute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u32>> + Send + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            compute: Some(Arc::new(move || compute().boxed())),
        }
    }

    /// No checksum available; reads as zero
    pub fn unknown() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            compute: None,
        }
    }

    /// Resolve the checksum, computing it at most once
    pub async fn value(&self) -> Result<u32> {
        let value = self
            .cell
            .get_or_try_init(|| async {
                match &self.compute {
                    Some(compute) => compute().await,
                    None => Ok(0),
                }
            })
            .await?;
        Ok(*value)
    }

    /// The checksum if it has already been resolved
    pub fn cached(&self) -> Option<u32> {
        self.cell.get().copied()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cached() {
            Some(v) => write!(f, "Checksum({})", v),
            None if self.compute.is_some() => write!(f, "Checksum(lazy)"),
            None => write!(f, "Checksum(unknown)"),
        }
    }
}

/// Metadata of one object
#[derive(Debug, Clone)]
pub struct Attributes {
    /// Size in bytes
    pub size: u64,
    /// Modification time, if known
    pub mod_time: Option<SystemTime>,
    /// Path relative to the listing root; the join key for sync
    pub relative_path: String,
    /// CRC32C
    pub checksum: Checksum,
}

impl Attributes {
    pub fn new(size: u64, mod_time: Option<SystemTime>, checksum: Checksum) -> Self {
        Self {
            size,
            mod_time,
            relative_path: String::new(),
            checksum,
        }
    }

    /// Replace the relative path
    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = relative_path.into();
        self
    }

    /// Modification time, treating the epoch as unknown
    pub fn known_mod_time(&self) -> Option<SystemTime> {
        self.mod_time.filter(|t| *t > UNIX_EPOCH)
    }

    /// Equality used by sync to decide whether a copy is needed
    ///
    /// Size and relative path must match. Without `force_checksum`, two
    /// known modification times decide the result; otherwise both CRC32C
    /// values are resolved and compared.
    pub async fn same(&self, other: Option<&Attributes>, force_checksum: bool) -> Result<bool> {
        let Some(other) = other else {
            return Ok(false);
        };

        if self.relative_path != other.relative_path || self.size != other.size {
            return Ok(false);
        }

        if !force_checksum {
            if let (Some(a), Some(b)) = (self.known_mod_time(), other.known_mod_time()) {
                return Ok(a == b);
            }
        }

        Ok(self.checksum.value().await? == other.checksum.value().await?)
    }
}

/// Classification of a locator
#[derive(Debug, Clone)]
pub enum ResourceKind {
    /// Neither an object nor a directory
    Invalid,
    /// A single object
    Object(Attributes),
    /// A directory (prefix with children)
    Directory,
}

/// A locator bound to its classification; never reclassified
#[derive(Debug, Clone)]
pub struct Resource {
    pub locator: Locator,
    pub kind: ResourceKind,
}

impl Resource {
    /// Classify a locator against its backend
    pub async fn resolve(store: &dyn ObjectStore, locator: Locator) -> Result<Self> {
        if let Some(attrs) = store.attributes(&locator.bucket, &locator.path).await? {
            return Ok(Self::object(locator, attrs));
        }
        if store.is_directory(&locator.bucket, &locator.path).await? {
            return Ok(Self::directory(locator));
        }
        Ok(Self {
            locator,
            kind: ResourceKind::Invalid,
        })
    }

    pub fn object(locator: Locator, attrs: Attributes) -> Self {
        Self {
            locator,
            kind: ResourceKind::Object(attrs),
        }
    }

    pub fn directory(locator: Locator) -> Self {
        Self {
            locator,
            kind: ResourceKind::Directory,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self.kind, ResourceKind::Object(_))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ResourceKind::Directory)
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.kind, ResourceKind::Invalid)
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match &self.kind {
            ResourceKind::Object(attrs) => Some(attrs),
            _ => None,
        }
    }
}

/// Size of one node in a disk usage report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsage {
    pub name: String,
    pub size: u64,
}

/// Disk usage tree keyed by full path; directory names end with '/'
#[derive(Debug, Clone)]
pub struct UsageTree {
    name: String,
    size: u64,
    children: BTreeMap<String, UsageTree>,
}

impl UsageTree {
    /// Empty tree rooted at a directory prefix
    pub fn new(root: &str) -> Self {
        Self::node(locator::as_directory(root), 0)
    }

    fn node(name: String, size: u64) -> Self {
        Self {
            name,
            size,
            children: BTreeMap::new(),
        }
    }

    /// Add an object by its full name, creating missing parent directories
    pub fn insert(&mut self, name: &str, size: u64) {
        let rel = locator::relative_to(&self.name, name);
        let mut parts: Vec<&str> = rel.split('/').filter(|p| !p.is_empty()).collect();
        let Some(leaf) = parts.pop() else {
            self.size += size;
            return;
        };

        let mut current = self;
        let mut dir = current.name.clone();
        for part in parts {
            dir = locator::as_directory(&locator::join(&dir, part));
            current = current
                .children
                .entry(dir.clone())
                .or_insert_with(|| Self::node(dir.clone(), 0));
        }

        let leaf_name = locator::join(&dir, leaf);
        current
            .children
            .entry(leaf_name.clone())
            .or_insert_with(|| Self::node(leaf_name, 0))
            .size += size;
    }

    /// Size of this node plus all descendants
    pub fn total_size(&self) -> u64 {
        self.size + self.children.values().map(|c| c.total_size()).sum::<u64>()
    }

    /// Post-order listing: leaves before sub-directories, then by name, parent last
    pub fn flatten(&self) -> Vec<DiskUsage> {
        let mut children: Vec<&UsageTree> = self.children.values().collect();
        children.sort_by(|a, b| {
            (!a.children.is_empty())
                .cmp(&!b.children.is_empty())
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut out = Vec::new();
        for child in children {
            out.extend(child.flatten());
        }
        out.push(DiskUsage {
            name: self.name.clone(),
            size: self.total_size(),
        });
        out
    }
}
