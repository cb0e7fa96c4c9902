//! Local filesystem backend

use crate::checksum::{file_crc32c, ChecksumCache};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator, Scheme};
use crate::storage::{ByteStream, LockState, LockToken, LockingStore, ObjectStore};
use crate::transfer::{is_temp_path, temp_path};
use crate::types::{Attributes, Checksum, Resource};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Local filesystem backend; paths are absolute and buckets are ignored
#[derive(Clone, Default)]
pub struct LocalStore {
    cache: Option<ChecksumCache>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache computed checksums under `cache_root`
    pub fn with_checksum_cache(cache_root: &Path) -> Self {
        Self {
            cache: Some(ChecksumCache::new(cache_root)),
        }
    }

    fn file_attributes(&self, path: &Path, metadata: &std::fs::Metadata) -> Attributes {
        let path = path.to_path_buf();
        let cache = self.cache.clone();
        let checksum = Checksum::lazy(move || {
            let path = path.clone();
            let cache = cache.clone();
            async move {
                match cache {
                    Some(cache) => cache.get_or_compute(&path).await,
                    None => file_crc32c(&path).await,
                }
            }
        });
        Attributes::new(metadata.len(), metadata.modified().ok(), checksum)
    }

    fn object(&self, prefix: &str, path: &Path, metadata: &std::fs::Metadata) -> Resource {
        let full = path.to_string_lossy().into_owned();
        let attrs = self
            .file_attributes(path, metadata)
            .with_relative_path(locator::relative_to(prefix, &full));
        Resource::object(Locator::local(full), attrs)
    }

    async fn walk(&self, prefix: &str) -> Result<Vec<Resource>> {
        let root = PathBuf::from(prefix);
        let store = self.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut results = Vec::new();

            for entry in jwalk::WalkDir::new(&root)
                .skip_hidden(false)
                .follow_links(false)
                .sort(true)
                .parallelism(jwalk::Parallelism::RayonNewPool(num_cpus::get()))
            {
                match entry {
                    Ok(e) => {
                        if !e.file_type().is_file() || is_temp_file(&e.path()) {
                            continue;
                        }
                        let path = e.path();
                        match e.metadata() {
                            Ok(metadata) => results.push(store.object(&prefix, &path, &metadata)),
                            Err(err) => {
                                tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable entry")
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Error walking directory");
                    }
                }
            }

            results
        })
        .await
        .map_err(|e| Error::io("walking directory", std::io::Error::other(e.to_string())))
    }

    async fn read_children(&self, prefix: &str) -> Result<Vec<Resource>> {
        let mut dir = match fs::read_dir(prefix).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("reading directory {}", prefix), e)),
        };

        let mut results = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("reading directory {}", prefix), e))?
        {
            let path = entry.path();
            let metadata = match fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if metadata.is_dir() {
                let dir_path = locator::as_directory(&path.to_string_lossy());
                results.push(Resource::directory(Locator::local(dir_path)));
            } else if metadata.is_file() && !is_temp_file(&path) {
                results.push(self.object(prefix, &path, &metadata));
            }
        }
        results.sort_by(|a, b| a.locator.path.cmp(&b.locator.path));
        Ok(results)
    }
}

fn is_temp_file(path: &Path) -> bool {
    is_temp_path(&path.to_string_lossy())
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(format!("creating directory {}", parent.display()), e))?;
    }
    Ok(())
}

/// Set a file's modification time
pub async fn set_file_mtime(path: &Path, mtime: SystemTime) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|f| f.set_modified(mtime))
            .map_err(|e| Error::io(format!("setting mtime of {}", path.display()), e))
    })
    .await
    .map_err(|e| Error::io("setting mtime", std::io::Error::other(e.to_string())))?
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn scheme(&self) -> Scheme {
        Scheme::Local
    }

    async fn init(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn attributes(&self, _bucket: &str, path: &str) -> Result<Option<Attributes>> {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {
                let attrs = self
                    .file_attributes(Path::new(path), &metadata)
                    .with_relative_path(locator::file_name(path));
                Ok(Some(attrs))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("reading metadata of {}", path), e)),
        }
    }

    async fn list_prefix(
        &self,
        _bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Resource>> {
        if recursive {
            if !fs::metadata(prefix).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Ok(Vec::new());
            }
            self.walk(prefix).await
        } else {
            self.read_children(prefix).await
        }
    }

    async fn peek_keys(&self, _bucket: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let children = self.read_children(&locator::as_directory(prefix)).await?;
        Ok(children
            .into_iter()
            .take(limit)
            .map(|r| r.locator.path)
            .collect())
    }

    /// Any existing directory counts, even an empty one
    async fn is_directory(&self, _bucket: &str, path: &str) -> Result<bool> {
        match fs::metadata(path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(format!("reading metadata of {}", path), e)),
        }
    }

    async fn delete(&self, _bucket: &str, path: &str) -> Result<()> {
        let metadata = match fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(path)),
            Err(e) => return Err(Error::io(format!("reading metadata of {}", path), e)),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(path)
                .await
                .map_err(|e| Error::io(format!("removing directory {}", path), e))?;
        } else {
            fs::remove_file(path)
                .await
                .map_err(|e| Error::io(format!("removing file {}", path), e))?;
        }
        tracing::debug!(path, "Deleted");
        Ok(())
    }

    async fn copy(&self, _src_bucket: &str, src: &str, _dst_bucket: &str, dst: &str) -> Result<()> {
        let metadata = match fs::metadata(src).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(src)),
            Err(e) => return Err(Error::io(format!("reading metadata of {}", src), e)),
        };

        let dst_path = Path::new(dst);
        create_parent(dst_path).await?;
        fs::copy(src, dst_path)
            .await
            .map_err(|e| Error::io(format!("copying {} to {}", src, dst), e))?;

        if let Ok(mtime) = metadata.modified() {
            set_file_mtime(dst_path, mtime).await?;
        }
        tracing::debug!(src, dst, "Copied");
        Ok(())
    }

    async fn move_object(
        &self,
        src_bucket: &str,
        src: &str,
        dst_bucket: &str,
        dst: &str,
    ) -> Result<()> {
        create_parent(Path::new(dst)).await?;
        match fs::rename(src, dst).await {
            Ok(()) => {
                tracing::debug!(src, dst, "Renamed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(src)),
            Err(e) => {
                // Rename across filesystems fails; fall back to copy and delete
                tracing::debug!(src, dst, error = %e, "Rename failed, copying instead");
                self.copy(src_bucket, src, dst_bucket, dst).await?;
                self.delete(src_bucket, src).await
            }
        }
    }

    async fn cat(&self, _bucket: &str, path: &str) -> Result<Bytes> {
        match fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(Error::io(format!("reading {}", path), e)),
        }
    }

    async fn open_range(
        &self,
        _bucket: &str,
        _path: &str,
        _start: u64,
        _end: u64,
    ) -> Result<ByteStream> {
        Err(Error::Unsupported {
            operation: "ranged read",
            backend: "local",
        })
    }

    async fn upload(&self, _ctx: &Context, _src: &Path, _bucket: &str, _path: &str) -> Result<()> {
        Err(Error::Unsupported {
            operation: "upload",
            backend: "local",
        })
    }

    async fn write(
        &self,
        _bucket: &str,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let dst = Path::new(path);
        create_parent(dst).await?;

        let tmp = temp_path(dst);
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| Error::io(format!("creating {}", tmp.display()), e))?;
        let written = tokio::io::copy(data, &mut file)
            .await
            .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
        file.flush()
            .await
            .map_err(|e| Error::io(format!("flushing {}", tmp.display()), e))?;
        drop(file);

        fs::rename(&tmp, dst)
            .await
            .map_err(|e| Error::io(format!("renaming {} to {}", tmp.display(), path), e))?;
        tracing::debug!(path, bytes = written, "Written");
        Ok(())
    }

    async fn download(
        &self,
        _ctx: &Context,
        _bucket: &str,
        _path: &str,
        _dst: &Path,
        _force_checksum: bool,
    ) -> Result<()> {
        Err(Error::Unsupported {
            operation: "download",
            backend: "local",
        })
    }

    fn locking(&self) -> Option<&dyn LockingStore> {
        Some(self)
    }
}

/// File presence is the lock, the file mtime its clock, and a random value
/// written into it the fencing token
#[async_trait]
impl LockingStore for LocalStore {
    async fn create_if_absent(
        &self,
        _bucket: &str,
        path: &str,
        _body: Bytes,
    ) -> Result<Option<LockToken>> {
        let lock_path = Path::new(path);
        create_parent(lock_path).await?;

        let token: u64 = rand::random();
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(Error::io(format!("creating lock {}", path), e)),
        };

        file.write_all(&token.to_le_bytes())
            .await
            .map_err(|e| Error::io(format!("writing lock {}", path), e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(format!("syncing lock {}", path), e))?;

        Ok(Some(LockToken::Generation(token)))
    }

    async fn lock_state(&self, _bucket: &str, path: &str) -> Result<Option<LockState>> {
        let data = match fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("reading lock {}", path), e)),
        };
        let metadata = match fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(format!("reading lock {}", path), e)),
        };

        let token = token_of(&data);
        let last_modified = metadata
            .modified()
            .map_err(|e| Error::io(format!("reading mtime of {}", path), e))?;

        Ok(Some(LockState {
            token: LockToken::Generation(token),
            last_modified,
        }))
    }

    /// The lock file is renamed aside before its token is read, so a lock
    /// re-created at `path` in the meantime is never the one removed. A
    /// foreign lock is linked back into place; while it is aside, another
    /// racer may take the path, and the foreign lock is then dropped.
    async fn delete_if_matches(&self, _bucket: &str, path: &str, token: &LockToken) -> Result<bool> {
        let claimed = format!("{}.release-{:016x}", path, rand::random::<u64>());
        match fs::rename(path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(format!("claiming lock {}", path), e)),
        }

        let data = fs::read(&claimed)
            .await
            .map_err(|e| Error::io(format!("reading lock {}", claimed), e))?;
        let matches = LockToken::Generation(token_of(&data)) == *token;

        if !matches {
            match fs::hard_link(&claimed, path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!(path, "Lock was taken while a foreign lock was set aside");
                }
                Err(e) => return Err(Error::io(format!("restoring lock {}", path), e)),
            }
        }

        fs::remove_file(&claimed)
            .await
            .map_err(|e| Error::io(format!("removing lock {}", claimed), e))?;
        Ok(matches)
    }
}

/// Token stored in a lock file; a file still being written reads as 0
fn token_of(data: &[u8]) -> u64 {
    <[u8; 8]>::try_from(data.get(..8).unwrap_or_default())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn p(tmp: &TempDir, rel: &str) -> String {
        tmp.path().join(rel).to_string_lossy().into_owned()
    }

    fn write(tmp: &TempDir, rel: &str, data: &[u8]) {
        let path = tmp.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_attributes_and_checksum() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "digits.txt", b"123456789");
        let store = LocalStore::new();

        let attrs = store.attributes("", &p(&tmp, "digits.txt")).await.unwrap().unwrap();
        assert_eq!(attrs.size, 9);
        assert_eq!(attrs.relative_path, "digits.txt");
        assert_eq!(attrs.checksum.value().await.unwrap(), 0xE306_9283);

        assert!(store.attributes("", &p(&tmp, "missing")).await.unwrap().is_none());
        // Directories are not objects
        assert!(store.attributes("", &p(&tmp, "")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_recursive_hides_temp_files() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "a.txt", b"a");
        write(&tmp, "sub/b.txt", b"bb");
        write(&tmp, "sub/c.bin_.gstmp", b"partial");
        let store = LocalStore::new();

        let listed = store.list("", &p(&tmp, ""), true).await.unwrap();
        let mut rels: Vec<String> = listed
            .iter()
            .filter_map(|r| r.attributes().map(|a| a.relative_path.clone()))
            .collect();
        rels.sort();
        assert_eq!(rels, vec!["a.txt", "sub/b.txt"]);
    }

    #[tokio::test]
    async fn test_list_shallow_and_single_object() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "a.txt", b"a");
        write(&tmp, "sub/b.txt", b"bb");
        let store = LocalStore::new();

        let listed = store.list("", &p(&tmp, ""), false).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_object());
        assert!(listed[1].is_directory());
        assert!(listed[1].locator.path.ends_with("sub/"));

        let single = store.list("", &p(&tmp, "sub/b.txt"), true).await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].attributes().unwrap().relative_path, "b.txt");
    }

    #[tokio::test]
    async fn test_copy_preserves_mtime() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "src.txt", b"payload");
        let mtime = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        set_file_mtime(&tmp.path().join("src.txt"), mtime).await.unwrap();

        let store = LocalStore::new();
        let dst = p(&tmp, "out/deep/dst.txt");
        store.copy("", &p(&tmp, "src.txt"), "", &dst).await.unwrap();

        let meta = std::fs::metadata(&dst).unwrap();
        assert_eq!(meta.modified().unwrap(), mtime);
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_and_delete() {
        let tmp = TempDir::new().unwrap();
        write(&tmp, "a.txt", b"a");
        let store = LocalStore::new();

        store
            .move_object("", &p(&tmp, "a.txt"), "", &p(&tmp, "moved/a.txt"))
            .await
            .unwrap();
        assert!(!tmp.path().join("a.txt").exists());
        assert!(tmp.path().join("moved/a.txt").exists());

        store.delete("", &p(&tmp, "moved/a.txt")).await.unwrap();
        assert!(matches!(
            store.delete("", &p(&tmp, "moved/a.txt")).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_transfers_are_unsupported() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let ctx = Context::for_tests(tmp.path());

        let err = store
            .download(&ctx, "", &p(&tmp, "x"), &tmp.path().join("y"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { operation: "download", .. }));

        let err = store
            .upload(&ctx, &tmp.path().join("x"), "", "y")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { operation: "upload", .. }));
        ctx.pool.close().await;
    }

    #[tokio::test]
    async fn test_lock_primitives() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let lock = p(&tmp, "locks/job.lock");

        let token = store
            .create_if_absent("", &lock, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .create_if_absent("", &lock, Bytes::new())
            .await
            .unwrap()
            .is_none());

        let state = store.lock_state("", &lock).await.unwrap().unwrap();
        assert_eq!(state.token, token);

        let foreign = LockToken::Generation(match &token {
            LockToken::Generation(g) => g.wrapping_add(1),
            LockToken::ETag(_) => 0,
        });
        assert!(!store.delete_if_matches("", &lock, &foreign).await.unwrap());
        assert!(store.delete_if_matches("", &lock, &token).await.unwrap());
        assert!(store.lock_state("", &lock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_leaves_other_holders_alone() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let lock = p(&tmp, "locks/job.lock");

        let stale = store
            .create_if_absent("", &lock, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        let stale_mtime = store.lock_state("", &lock).await.unwrap().unwrap().last_modified;
        assert!(store.delete_if_matches("", &lock, &stale).await.unwrap());

        // Someone else takes the lock; the stale holder's release must not touch it
        let current = store
            .create_if_absent("", &lock, Bytes::new())
            .await
            .unwrap()
            .unwrap();
        let before = store.lock_state("", &lock).await.unwrap().unwrap();
        assert!(!store.delete_if_matches("", &lock, &stale).await.unwrap());

        let after = store.lock_state("", &lock).await.unwrap().unwrap();
        assert_eq!(after.token, current);
        assert_eq!(after.last_modified, before.last_modified);
        assert!(after.last_modified >= stale_mtime);

        // Nothing set aside is left behind
        let names: Vec<String> = std::fs::read_dir(tmp.path().join("locks"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["job.lock"]);

        // Releasing a lock that is gone is a no-op
        assert!(store.delete_if_matches("", &lock, &current).await.unwrap());
        assert!(!store.delete_if_matches("", &lock, &current).await.unwrap());
    }
}
