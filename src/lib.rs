//! gsg - copy, sync and lock objects across cloud buckets and local disk
//!
//! One [`storage::ObjectStore`] interface covers Google Cloud Storage, AWS S3,
//! Cloudflare R2 and the local filesystem. Large downloads are split into
//! byte ranges and run on a depth-layered worker pool; `rsync` diffs two
//! listings by size, modification time and CRC32C; a distributed lock is
//! built on conditional create and delete.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod locator;
pub mod lock;
pub mod object;
pub mod ops;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod types;

pub use config::Config;
pub use context::{Context, Registry};
pub use error::{Error, Result};
pub use locator::{Locator, Scheme};
pub use object::{Object, ObjectClient};
