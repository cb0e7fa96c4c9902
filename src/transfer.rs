//! Chunked parallel download with atomic finalize
//!
//! An object of size S is split into `max(1, ceil(S/C))` disjoint byte
//! ranges. Each range is fetched by its own depth-0 pool job straight into a
//! pre-sized temp file next to the destination; a depth-1 job waits for all
//! of them, renames the temp file into place, restores the modification time
//! and optionally verifies the CRC32C.

use crate::checksum::file_crc32c;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator;
use crate::pool::{self, CHUNK_DEPTH, FINALIZE_DEPTH};
use crate::progress::ProgressSink;
use crate::storage::local::set_file_mtime;
use crate::storage::{encode_mtime, ObjectStore};
use futures::StreamExt;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Suffix of in-progress downloads
pub const TEMP_SUFFIX: &str = "_.gstmp";

/// Temp file holding an in-progress download of `dst`
pub fn temp_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// True for paths that name an in-progress download
pub fn is_temp_path(path: &str) -> bool {
    path.ends_with(TEMP_SUFFIX)
}

/// Split of an object into chunk ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub size: u64,
    pub chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(size: u64, chunk_size: u64) -> Self {
        Self {
            size,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of chunks; at least one, even for an empty object
    pub fn count(&self) -> u64 {
        self.size.div_ceil(self.chunk_size).max(1)
    }

    /// Byte range of chunk `i`
    pub fn range(&self, i: u64) -> Range<u64> {
        let start = (i * self.chunk_size).min(self.size);
        let end = ((i + 1) * self.chunk_size).min(self.size);
        start..end
    }

    pub fn ranges(&self) -> Vec<Range<u64>> {
        (0..self.count()).map(|i| self.range(i)).collect()
    }
}

/// A local file about to be uploaded
#[derive(Debug, Clone)]
pub struct LocalSource {
    pub path: PathBuf,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
}

impl LocalSource {
    pub async fn open(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| Error::io(format!("reading metadata of {}", path.display()), e))?;
        if !metadata.is_file() {
            return Err(Error::not_found(path.display().to_string()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            mod_time: metadata.modified().ok(),
        })
    }

    /// Value for the modification-time metadata key
    pub fn mtime_metadata(&self) -> Option<String> {
        self.mod_time.map(encode_mtime)
    }
}

/// Shared state of one chunked download
struct Transfer {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    path: String,
    size: u64,
    tmp: PathBuf,
    prepared: OnceCell<()>,
    cancel: CancellationToken,
    sink: ProgressSink,
}

impl Transfer {
    /// Create the destination directory and the pre-sized temp file
    async fn prepare(&self) -> Result<()> {
        if let Some(parent) = self.tmp.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(format!("creating directory {}", parent.display()), e))?;
        }
        let file = fs::File::create(&self.tmp)
            .await
            .map_err(|e| Error::io(format!("creating {}", self.tmp.display()), e))?;
        file.set_len(self.size)
            .await
            .map_err(|e| Error::io(format!("sizing {}", self.tmp.display()), e))?;
        Ok(())
    }

    async fn fetch(&self, range: Range<u64>) -> Result<()> {
        self.prepared.get_or_try_init(|| self.prepare()).await?;
        if range.is_empty() {
            return Ok(());
        }

        let mut stream = self
            .store
            .open_range(&self.bucket, &self.path, range.start, range.end)
            .await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&self.tmp)
            .await
            .map_err(|e| Error::io(format!("opening {}", self.tmp.display()), e))?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|e| Error::io(format!("seeking {}", self.tmp.display()), e))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(format!("writing {}", self.tmp.display()), e))?;
            written += chunk.len() as u64;
            self.sink.advance(chunk.len() as u64);
        }

        if written != range.end - range.start {
            return Err(Error::backend(
                self.store.name(),
                format!(
                    "short read of {} range {}..{}: got {} bytes",
                    self.path, range.start, range.end, written
                ),
            ));
        }

        file.flush()
            .await
            .map_err(|e| Error::io(format!("flushing {}", self.tmp.display()), e))?;
        file.sync_data()
            .await
            .map_err(|e| Error::io(format!("syncing {}", self.tmp.display()), e))?;
        Ok(())
    }

    /// Fetch one chunk; a failure cancels the chunks that have not started
    async fn run_chunk(self: Arc<Self>, index: u64, range: Range<u64>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let result = self.fetch(range.clone()).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                tracing::debug!(
                    path = %self.path,
                    chunk = index,
                    start = range.start,
                    end = range.end,
                    error = %e,
                    "Chunk failed, cancelling transfer"
                );
            }
            self.cancel.cancel();
        }
        result
    }
}

/// Download `bucket/path` from `store` to `dst` in parallel chunks
///
/// The partially written temp file is left in place when the transfer fails.
pub async fn download(
    ctx: &Context,
    store: Arc<dyn ObjectStore>,
    bucket: &str,
    path: &str,
    dst: &Path,
    force_checksum: bool,
) -> Result<()> {
    let attrs = store
        .attributes(bucket, path)
        .await?
        .ok_or_else(|| Error::not_found(format!("{}://{}/{}", store.scheme().as_str(), bucket, path)))?;

    let plan = ChunkPlan::new(attrs.size, ctx.config.effective_chunk_size());
    let transfer = Arc::new(Transfer {
        store,
        bucket: bucket.to_string(),
        path: path.to_string(),
        size: attrs.size,
        tmp: temp_path(dst),
        prepared: OnceCell::new(),
        cancel: CancellationToken::new(),
        sink: ctx
            .progress
            .new_sink(attrs.size, format!("Downloading [{}]", locator::file_name(path))),
    });

    tracing::debug!(
        bucket,
        path,
        dst = %dst.display(),
        size = attrs.size,
        chunks = plan.count(),
        "Starting chunked download"
    );

    let mut chunks = Vec::with_capacity(plan.count() as usize);
    for (index, range) in plan.ranges().into_iter().enumerate() {
        let transfer = transfer.clone();
        chunks.push(
            ctx.pool
                .spawn_at_depth(CHUNK_DEPTH, transfer.run_chunk(index as u64, range))
                .await?,
        );
    }

    let dst = dst.to_path_buf();
    let finalize = ctx
        .pool
        .spawn_at_depth(FINALIZE_DEPTH, async move {
            pool::join_all(chunks).await?;

            fs::rename(&transfer.tmp, &dst).await.map_err(|e| {
                Error::io(
                    format!("renaming {} to {}", transfer.tmp.display(), dst.display()),
                    e,
                )
            })?;

            if let Some(mtime) = attrs.known_mod_time() {
                set_file_mtime(&dst, mtime).await?;
            }

            if force_checksum {
                let expected = attrs.checksum.value().await?;
                let actual = file_crc32c(&dst).await?;
                if expected != actual {
                    return Err(Error::ChecksumMismatch {
                        path: dst.display().to_string(),
                        expected,
                        actual,
                    });
                }
            }

            transfer.sink.finish();
            tracing::debug!(path = %transfer.path, dst = %dst.display(), "Download complete");
            Ok(())
        })
        .await?;

    finalize.join().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_count_boundaries() {
        let c = 8 * MB;
        assert_eq!(ChunkPlan::new(0, c).count(), 1);
        assert_eq!(ChunkPlan::new(c - 1, c).count(), 1);
        assert_eq!(ChunkPlan::new(c, c).count(), 1);
        assert_eq!(ChunkPlan::new(c + 1, c).count(), 2);
        assert_eq!(ChunkPlan::new(5 * c, c).count(), 5);
    }

    #[test]
    fn test_ranges_cover_object() {
        let plan = ChunkPlan::new(25 * MB, 8 * MB);
        let sizes: Vec<u64> = plan.ranges().iter().map(|r| r.end - r.start).collect();
        assert_eq!(sizes, vec![8 * MB, 8 * MB, 8 * MB, MB]);

        let ranges = plan.ranges();
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(ranges.first().unwrap().start, 0);
        assert_eq!(ranges.last().unwrap().end, 25 * MB);
    }

    #[test]
    fn test_empty_object_has_one_empty_range() {
        let plan = ChunkPlan::new(0, 16);
        assert_eq!(plan.ranges(), vec![0..0]);
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/data/file.bin")),
            PathBuf::from("/data/file.bin_.gstmp")
        );
        assert!(is_temp_path("abc/file.go_.gstmp"));
        assert!(!is_temp_path("abc/file.go"));
    }

    #[tokio::test]
    async fn test_local_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("up.txt");
        std::fs::write(&path, b"hello").unwrap();

        let source = LocalSource::open(&path).await.unwrap();
        assert_eq!(source.size, 5);
        assert!(source.mtime_metadata().unwrap().parse::<u128>().is_ok());

        assert!(LocalSource::open(tmp.path()).await.is_err());
    }
}
