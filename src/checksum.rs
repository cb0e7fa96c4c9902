//! CRC32C of local files, with an on-disk cache keyed by path and mtime

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncReadExt;

const READ_BUF_SIZE: usize = 1024 * 1024;

/// Stream a file through CRC32C
pub async fn file_crc32c(path: &Path) -> Result<u32> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut crc = 0u32;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buf[..n]);
    }
    Ok(crc)
}

/// Cache of local file checksums
#[derive(Debug, Clone)]
pub struct ChecksumCache {
    dir: PathBuf,
}

impl ChecksumCache {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            dir: cache_root.join("crc32c"),
        }
    }

    fn entry_path(&self, path: &Path, mtime: Option<SystemTime>) -> PathBuf {
        let nanos = mtime
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b"|");
        hasher.update(nanos.to_string().as_bytes());
        self.dir.join(hasher.finalize().to_hex().as_str())
    }

    /// Cached checksum of a file, computing and storing it on a miss
    pub async fn get_or_compute(&self, path: &Path) -> Result<u32> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| Error::io(format!("reading metadata of {}", path.display()), e))?;
        let entry = self.entry_path(path, meta.modified().ok());

        if let Ok(bytes) = fs::read(&entry).await {
            if let Ok(raw) = <[u8; 4]>::try_from(bytes.as_slice()) {
                let crc = u32::from_le_bytes(raw);
                tracing::trace!(path = %path.display(), crc, "Loaded crc32c from cache");
                return Ok(crc);
            }
        }

        let crc = file_crc32c(path).await?;

        if let Err(e) = self.store(&entry, crc).await {
            tracing::debug!(path = %path.display(), error = %e, "Failed to cache crc32c");
        }
        Ok(crc)
    }

    async fn store(&self, entry: &Path, crc: u32) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(entry, crc.to_le_bytes()).await
    }
}
