//! Shared helpers for integration tests: an in-memory remote backend and
//! context builders

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use gsg::config::{Config, STAGING_MARKER};
use gsg::context::{Context, Registry};
use gsg::error::{Error, Result};
use gsg::locator::{Locator, Scheme};
use gsg::storage::{ByteStream, LocalStore, LockState, LockToken, LockingStore, ObjectStore};
use gsg::transfer::{self, LocalSource};
use gsg::types::{Attributes, Checksum, Resource};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tempfile::TempDir;

#[derive(Clone)]
struct Entry {
    data: Bytes,
    mtime: Option<SystemTime>,
    generation: u64,
}

/// Remote backend double holding objects in memory
#[derive(Clone)]
pub struct MemoryStore {
    scheme: Scheme,
    objects: Arc<Mutex<BTreeMap<(String, String), Entry>>>,
    next_generation: Arc<AtomicU64>,
    ranged_reads: Arc<AtomicUsize>,
    corrupt_reads: Arc<AtomicBool>,
    failing_offset: Arc<Mutex<Option<u64>>>,
}

impl MemoryStore {
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
            ranged_reads: Arc::new(AtomicUsize::new(0)),
            corrupt_reads: Arc::new(AtomicBool::new(false)),
            failing_offset: Arc::new(Mutex::new(None)),
        }
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<(String, String), Entry>> {
        self.objects.lock().unwrap()
    }

    fn entry(&self, data: Bytes, mtime: Option<SystemTime>) -> Entry {
        Entry {
            data,
            mtime,
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Store an object directly
    pub fn put(&self, bucket: &str, path: &str, data: impl Into<Bytes>, mtime: Option<SystemTime>) {
        let entry = self.entry(data.into(), mtime);
        self.objects()
            .insert((bucket.to_string(), path.to_string()), entry);
    }

    pub fn get(&self, bucket: &str, path: &str) -> Option<Bytes> {
        self.objects()
            .get(&(bucket.to_string(), path.to_string()))
            .map(|e| e.data.clone())
    }

    pub fn mtime(&self, bucket: &str, path: &str) -> Option<SystemTime> {
        self.objects()
            .get(&(bucket.to_string(), path.to_string()))
            .and_then(|e| e.mtime)
    }

    /// All keys in a bucket
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Number of `open_range` calls so far
    pub fn ranged_reads(&self) -> usize {
        self.ranged_reads.load(Ordering::SeqCst)
    }

    /// Flip the first byte of every ranged read from now on
    pub fn corrupt_reads(&self, on: bool) {
        self.corrupt_reads.store(on, Ordering::SeqCst);
    }

    /// Make the ranged read starting at `offset` fail from now on
    pub fn fail_range_at(&self, offset: Option<u64>) {
        *self.failing_offset.lock().unwrap() = offset;
    }

    fn missing(&self, bucket: &str, path: &str) -> Error {
        Error::not_found(format!("{}://{}/{}", self.scheme.as_str(), bucket, path))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn scheme(&self) -> Scheme {
        self.scheme
    }

    async fn init(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn attributes(&self, bucket: &str, path: &str) -> Result<Option<Attributes>> {
        Ok(self
            .objects()
            .get(&(bucket.to_string(), path.to_string()))
            .map(|e| {
                Attributes::new(
                    e.data.len() as u64,
                    e.mtime,
                    Checksum::known(crc32c::crc32c(&e.data)),
                )
            }))
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Resource>> {
        let mut dirs = BTreeSet::new();
        let mut results = Vec::new();
        for ((b, key), e) in self.objects().iter() {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            let rel = &key[prefix.len()..];
            if !recursive {
                if let Some((first, _)) = rel.split_once('/') {
                    dirs.insert(format!("{}{}/", prefix, first));
                    continue;
                }
            }
            let attrs = Attributes::new(
                e.data.len() as u64,
                e.mtime,
                Checksum::known(crc32c::crc32c(&e.data)),
            )
            .with_relative_path(rel);
            results.push(Resource::object(
                Locator::remote(self.scheme, bucket, key.clone()),
                attrs,
            ));
        }
        results.extend(
            dirs.into_iter()
                .map(|d| Resource::directory(Locator::remote(self.scheme, bucket, d))),
        );
        Ok(results)
    }

    async fn peek_keys(&self, bucket: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .take(limit)
            .collect())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        self.objects()
            .remove(&(bucket.to_string(), path.to_string()))
            .map(|_| ())
            .ok_or_else(|| self.missing(bucket, path))
    }

    async fn copy(&self, src_bucket: &str, src: &str, dst_bucket: &str, dst: &str) -> Result<()> {
        let source = self
            .objects()
            .get(&(src_bucket.to_string(), src.to_string()))
            .cloned()
            .ok_or_else(|| self.missing(src_bucket, src))?;
        self.put(dst_bucket, dst, source.data, source.mtime);
        Ok(())
    }

    async fn cat(&self, bucket: &str, path: &str) -> Result<Bytes> {
        self.get(bucket, path)
            .ok_or_else(|| self.missing(bucket, path))
    }

    async fn open_range(
        &self,
        bucket: &str,
        path: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream> {
        self.ranged_reads.fetch_add(1, Ordering::SeqCst);
        if *self.failing_offset.lock().unwrap() == Some(start) {
            return Err(Error::backend("memory", format!("range read at {} refused", start)));
        }
        let data = self.cat(bucket, path).await?;
        let end = (end as usize).min(data.len());
        let mut slice = data.slice(start as usize..end);
        if self.corrupt_reads.load(Ordering::SeqCst) && !slice.is_empty() {
            let mut bytes = slice.to_vec();
            bytes[0] ^= 0xff;
            slice = Bytes::from(bytes);
        }
        Ok(Box::pin(futures::stream::once(async move { Ok(slice) })))
    }

    async fn upload(&self, _ctx: &Context, src: &Path, bucket: &str, path: &str) -> Result<()> {
        let source = LocalSource::open(src).await?;
        let data = tokio::fs::read(&source.path)
            .await
            .map_err(|e| Error::io(format!("reading {}", src.display()), e))?;
        self.put(bucket, path, data, source.mod_time);
        Ok(())
    }

    async fn write(
        &self,
        bucket: &str,
        path: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let mut body = Vec::new();
        data.read_to_end(&mut body)
            .await
            .map_err(|e| Error::io(format!("reading body for {}", path), e))?;
        self.put(bucket, path, body, Some(SystemTime::now()));
        Ok(())
    }

    async fn download(
        &self,
        ctx: &Context,
        bucket: &str,
        path: &str,
        dst: &Path,
        force_checksum: bool,
    ) -> Result<()> {
        transfer::download(ctx, Arc::new(self.clone()), bucket, path, dst, force_checksum).await
    }

    fn locking(&self) -> Option<&dyn LockingStore> {
        Some(self)
    }
}

#[async_trait]
impl LockingStore for MemoryStore {
    async fn create_if_absent(
        &self,
        bucket: &str,
        path: &str,
        body: Bytes,
    ) -> Result<Option<LockToken>> {
        let mut objects = self.objects();
        let key = (bucket.to_string(), path.to_string());
        if objects.contains_key(&key) {
            return Ok(None);
        }
        let entry = self.entry(body, Some(SystemTime::now()));
        let token = LockToken::Generation(entry.generation);
        objects.insert(key, entry);
        Ok(Some(token))
    }

    async fn lock_state(&self, bucket: &str, path: &str) -> Result<Option<LockState>> {
        Ok(self
            .objects()
            .get(&(bucket.to_string(), path.to_string()))
            .map(|e| LockState {
                token: LockToken::Generation(e.generation),
                last_modified: e.mtime.unwrap_or_else(SystemTime::now),
            }))
    }

    async fn delete_if_matches(
        &self,
        bucket: &str,
        path: &str,
        token: &LockToken,
    ) -> Result<bool> {
        let mut objects = self.objects();
        let key = (bucket.to_string(), path.to_string());
        match objects.get(&key) {
            Some(e) if LockToken::Generation(e.generation) == *token => {
                objects.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Embedded, multi-worker configuration rooted in a scratch directory
pub fn test_config(scratch: &Path, chunk_size: u64) -> Config {
    Config {
        multi_thread: true,
        concurrency: 4,
        chunk_size,
        embedded: true,
        staging_dir: scratch.join(STAGING_MARKER),
        cache_dir: Some(scratch.join("cache")),
        ..Config::default()
    }
}

/// Context over the local backend plus the given remote doubles
pub fn context_with(scratch: &Path, chunk_size: u64, remotes: &[&MemoryStore]) -> Context {
    let mut registry = Registry::new().with(Scheme::Local, Arc::new(LocalStore::new()));
    for store in remotes {
        registry.register(store.scheme(), Arc::new((*store).clone()));
    }
    Context::with_registry(test_config(scratch, chunk_size), registry)
}

/// Write a file under `dir`, creating parents
pub fn create_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

pub fn read_file(dir: &TempDir, name: &str) -> Vec<u8> {
    fs::read(dir.path().join(name)).unwrap()
}

pub fn file_exists(dir: &TempDir, name: &str) -> bool {
    dir.path().join(name).exists()
}

/// Local locator for `name` under `dir`
pub fn local(dir: &TempDir, name: &str) -> Locator {
    let root = dir.path().to_string_lossy().into_owned();
    Locator::local(gsg::locator::join(&root, name))
}

/// Every file path below `dir`, relative to it
pub fn files_under(dir: &Path) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                out.extend(
                    files_under(&path)
                        .into_iter()
                        .map(|f| format!("{}/{}", name, f)),
                );
            } else {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    out.sort();
    out
}
