//! Command implementations behind the CLI
//!
//! Each operation takes the invocation [`Context`] and returns data; the
//! binary decides how to print it. Read-only operations accept a
//! [`RetryConfig`] and retry only when the caller asked for it.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator};
use crate::lock::{DistributedLock, TokenCache};
use crate::progress::format_size;
use crate::retry::{with_retry, RetryConfig};
use crate::storage::LockToken;
use crate::sync::execute::{CopyItem, Executor};
use crate::sync::{SyncEngine, SyncOptions, SyncReport};
use crate::types::{Attributes, DiskUsage, Resource, ResourceKind};
use bytes::Bytes;
use std::time::{Duration, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Flags shared by `cp` and `mv`
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub recursive: bool,
    pub force_checksum: bool,
}

/// Entries at `loc`; a single object lists as itself
pub async fn ls(
    ctx: &Context,
    loc: &Locator,
    recursive: bool,
    retry: &RetryConfig,
) -> Result<Vec<Resource>> {
    let store = ctx.store_for(loc).await?;
    let entries = with_retry(retry, || store.list(&loc.bucket, &loc.path, recursive)).await?;
    if entries.is_empty() && !store.is_directory(&loc.bucket, &loc.path).await? {
        return Err(Error::not_found(loc.to_string()));
    }
    Ok(entries)
}

/// Attributes of one object
pub async fn stat(ctx: &Context, loc: &Locator, retry: &RetryConfig) -> Result<Attributes> {
    let store = ctx.store_for(loc).await?;
    with_retry(retry, || store.attributes(&loc.bucket, &loc.path))
        .await?
        .ok_or_else(|| Error::not_found(loc.to_string()))
}

/// CRC32C of one object
pub async fn hash(ctx: &Context, loc: &Locator, retry: &RetryConfig) -> Result<u32> {
    let store = ctx.store_for(loc).await?;
    with_retry(retry, || store.checksum(&loc.bucket, &loc.path)).await
}

/// Whole contents of one object
pub async fn cat(ctx: &Context, loc: &Locator, retry: &RetryConfig) -> Result<Bytes> {
    let store = ctx.store_for(loc).await?;
    with_retry(retry, || store.cat(&loc.bucket, &loc.path)).await
}

/// Per-node sizes under `loc`
pub async fn du(ctx: &Context, loc: &Locator, retry: &RetryConfig) -> Result<Vec<DiskUsage>> {
    let store = ctx.store_for(loc).await?;
    if !Resource::resolve(store.as_ref(), loc.clone()).await?.is_valid() {
        return Err(Error::not_found(loc.to_string()));
    }
    with_retry(retry, || store.disk_usage(&loc.bucket, &loc.path)).await
}

/// `du` output lines: `<size> <uri>`, or just the total with `summary`
pub fn format_usage(loc: &Locator, usage: &[DiskUsage], human: bool, summary: bool) -> Vec<String> {
    let size = |n: u64| if human { format_size(n) } else { n.to_string() };
    if summary {
        let total = usage.last().map(|u| u.size).unwrap_or(0);
        return vec![format!("{} {}", size(total), loc)];
    }
    usage
        .iter()
        .map(|u| format!("{} {}", size(u.size), loc.with_path(u.name.clone())))
        .collect()
}

/// One line per `ls` entry
pub fn format_listing(entries: &[Resource]) -> Vec<String> {
    entries
        .iter()
        .map(|r| match &r.kind {
            ResourceKind::Directory => locator::as_directory(&r.locator.to_uri()),
            _ => r.locator.to_uri(),
        })
        .collect()
}

/// `stat` output
pub fn format_stat(loc: &Locator, attrs: &Attributes, crc: u32) -> Vec<String> {
    let modified = attrs
        .known_mod_time()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| format!("{}.{:09}", d.as_secs(), d.subsec_nanos()))
        .unwrap_or_else(|| "unknown".to_string());
    vec![
        format!("Path:     {}", loc),
        format!("Size:     {} ({})", attrs.size, format_size(attrs.size)),
        format!("Modified: {}", modified),
        format!("CRC32C:   {:08x}", crc),
    ]
}

/// Work out what `cp` and `mv` have to do
///
/// An object copied into a directory destination keeps its base name; so
/// does every source when there are several. A directory source needs
/// `recursive` and lands under the destination, inside a sub-directory of
/// its own name when the destination already exists.
pub async fn plan_copies(
    ctx: &Context,
    sources: &[Locator],
    dst: &Locator,
    recursive: bool,
) -> Result<Vec<CopyItem>> {
    let dst_store = ctx.store_for(dst).await?;
    let into_dir = sources.len() > 1
        || dst.path.is_empty()
        || dst.path.ends_with('/')
        || dst_store.is_directory(&dst.bucket, &dst.path).await?;

    let mut items = Vec::new();
    for src in sources {
        let resource = ctx.resolve(src).await?;
        match resource.kind {
            ResourceKind::Invalid => return Err(Error::not_found(src.to_string())),
            ResourceKind::Object(_) => {
                let target = if into_dir {
                    locator::join(&dst.path, locator::file_name(&src.path))
                } else {
                    dst.path.clone()
                };
                items.push(CopyItem::new(src.clone(), dst.with_path(target)));
            }
            ResourceKind::Directory if !recursive => {
                return Err(Error::InvalidLocator {
                    locator: src.to_string(),
                    reason: "is a directory (use -r)".to_string(),
                });
            }
            ResourceKind::Directory => {
                let base = if into_dir {
                    locator::join(&dst.path, locator::file_name(&src.path))
                } else {
                    dst.path.clone()
                };
                let store = ctx.store_for(src).await?;
                let listing = store
                    .list_prefix(&src.bucket, &locator::as_directory(&src.path), true)
                    .await?;
                for entry in listing {
                    if let Some(attrs) = entry.attributes() {
                        let target = locator::join(&base, &attrs.relative_path);
                        items.push(CopyItem::new(entry.locator.clone(), dst.with_path(target)));
                    }
                }
            }
        }
    }
    Ok(items)
}

/// Copy sources to `dst`
pub async fn cp(
    ctx: &Context,
    sources: &[Locator],
    dst: &Locator,
    options: CopyOptions,
) -> Result<Vec<CopyItem>> {
    let items = plan_copies(ctx, sources, dst, options.recursive).await?;
    tracing::info!(count = items.len(), dst = %dst, "Copying");

    let executor = Executor::new(ctx, dst, options.force_checksum);
    let copied = executor.copy_all(items.clone()).await;
    let cleaned = executor.finish().await;
    copied?;
    cleaned?;
    Ok(items)
}

/// Move sources to `dst`
pub async fn mv(
    ctx: &Context,
    sources: &[Locator],
    dst: &Locator,
    options: CopyOptions,
) -> Result<Vec<CopyItem>> {
    let items = plan_copies(ctx, sources, dst, options.recursive).await?;
    tracing::info!(count = items.len(), dst = %dst, "Moving");

    let executor = Executor::new(ctx, dst, options.force_checksum);
    let moved = executor.move_all(items.clone()).await;
    let cleaned = executor.finish().await;
    moved?;
    cleaned?;

    // Local sources leave their emptied directories behind
    for src in sources.iter().filter(|s| !s.is_remote() && options.recursive) {
        let store = ctx.store_for(src).await?;
        if !store.is_directory(&src.bucket, &src.path).await? {
            continue;
        }
        let left = store
            .list_prefix(&src.bucket, &locator::as_directory(&src.path), true)
            .await?;
        if left.is_empty() {
            store.delete(&src.bucket, &src.path).await?;
        }
    }
    Ok(items)
}

/// Remove an object, or everything under a directory with `recursive`
pub async fn rm(ctx: &Context, loc: &Locator, recursive: bool) -> Result<Vec<Locator>> {
    let store = ctx.store_for(loc).await?;
    let resource = Resource::resolve(store.as_ref(), loc.clone()).await?;
    let targets = match resource.kind {
        ResourceKind::Invalid => return Err(Error::not_found(loc.to_string())),
        ResourceKind::Object(_) => vec![loc.clone()],
        ResourceKind::Directory if !recursive => {
            return Err(Error::InvalidLocator {
                locator: loc.to_string(),
                reason: "is a directory (use -r)".to_string(),
            });
        }
        ResourceKind::Directory => store
            .list_prefix(&loc.bucket, &locator::as_directory(&loc.path), true)
            .await?
            .into_iter()
            .filter(|r| r.is_object())
            .map(|r| r.locator)
            .collect(),
    };

    tracing::info!(count = targets.len(), path = %loc, "Removing");
    Executor::new(ctx, loc, false)
        .delete_all(targets.clone())
        .await?;

    // Local directories themselves go too
    if resource.is_directory() && !loc.is_remote() {
        store.delete(&loc.bucket, &loc.path).await?;
    }
    Ok(targets)
}

/// Make `dst` match `src`
pub async fn rsync(
    ctx: &Context,
    src: &Locator,
    dst: &Locator,
    options: SyncOptions,
) -> Result<SyncReport> {
    SyncEngine::new(ctx).run(src, dst, options).await
}

/// Acquire the lock object at `loc`, waiting until it is free or `cancel` fires
///
/// The token is kept in the token cache so a later `unlock` invocation can
/// release it.
pub async fn lock(
    ctx: &Context,
    loc: &Locator,
    ttl: Duration,
    cancel: &CancellationToken,
) -> Result<LockToken> {
    if loc.path.is_empty() || loc.path.ends_with('/') {
        return Err(Error::InvalidLocator {
            locator: loc.to_string(),
            reason: "a lock must name an object, not a directory".to_string(),
        });
    }
    let store = ctx.store_for(loc).await?;
    if store.is_directory(&loc.bucket, &loc.path).await? {
        return Err(Error::InvalidLocator {
            locator: loc.to_string(),
            reason: "a lock must name an object, not a directory".to_string(),
        });
    }

    let mut lock = DistributedLock::new(store, loc.bucket.clone(), loc.path.clone());
    let token = lock.lock(ttl, cancel).await?;
    TokenCache::new(&ctx.config.effective_cache_dir())
        .store(loc, &token)
        .await?;
    tracing::info!(path = %loc, token = %token, "Locked");
    Ok(token)
}

/// Release a lock taken by an earlier `lock`
pub async fn unlock(ctx: &Context, loc: &Locator) -> Result<()> {
    let cache = TokenCache::new(&ctx.config.effective_cache_dir());
    let token = cache
        .load(loc)
        .await?
        .ok_or_else(|| Error::LockTokenMismatch {
            path: loc.to_string(),
            reason: "no lock token recorded for this path".to_string(),
        })?;

    let store = ctx.store_for(loc).await?;
    DistributedLock::new(store, loc.bucket.clone(), loc.path.clone())
        .with_token(token)
        .unlock()
        .await?;
    cache.remove(loc).await?;
    tracing::info!(path = %loc, "Unlocked");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local(tmp: &TempDir, rel: &str) -> Locator {
        Locator::local(locator::join(&tmp.path().to_string_lossy(), rel))
    }

    #[test]
    fn test_format_usage() {
        let loc = Locator::parse("gs://bucket/dir").unwrap();
        let usage = vec![
            DiskUsage { name: "dir/a".into(), size: 2048 },
            DiskUsage { name: "dir/".into(), size: 2048 },
        ];
        assert_eq!(
            format_usage(&loc, &usage, false, false),
            vec!["2048 gs://bucket/dir/a", "2048 gs://bucket/dir/"]
        );
        assert_eq!(format_usage(&loc, &usage, false, true), vec!["2048 gs://bucket/dir"]);
        assert!(format_usage(&loc, &usage, true, true)[0].starts_with("2 "));
    }

    #[tokio::test]
    async fn test_cp_object_into_directory_keeps_name() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(tmp.path().join("out")).unwrap();
        let ctx = Context::for_tests(tmp.path());

        let items = cp(&ctx, &[local(&tmp, "a.txt")], &local(&tmp, "out"), CopyOptions::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(std::fs::read(tmp.path().join("out/a.txt")).unwrap(), b"hello");
        ctx.pool.close().await;
    }

    #[tokio::test]
    async fn test_cp_directory_requires_recursive() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/sub")).unwrap();
        std::fs::write(tmp.path().join("src/sub/x"), b"x").unwrap();
        let ctx = Context::for_tests(tmp.path());

        let err = cp(&ctx, &[local(&tmp, "src")], &local(&tmp, "dst"), CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLocator { .. }));

        let options = CopyOptions { recursive: true, ..CopyOptions::default() };
        cp(&ctx, &[local(&tmp, "src")], &local(&tmp, "dst"), options).await.unwrap();
        assert!(tmp.path().join("dst/sub/x").exists());
        ctx.pool.close().await;
    }

    #[tokio::test]
    async fn test_mv_and_rm() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/one"), b"1").unwrap();
        std::fs::write(tmp.path().join("d/two"), b"22").unwrap();
        let ctx = Context::for_tests(tmp.path());

        mv(&ctx, &[local(&tmp, "d/one")], &local(&tmp, "moved"), CopyOptions::default())
            .await
            .unwrap();
        assert!(!tmp.path().join("d/one").exists());
        assert_eq!(std::fs::read(tmp.path().join("moved")).unwrap(), b"1");

        assert!(rm(&ctx, &local(&tmp, "d"), false).await.is_err());
        let removed = rm(&ctx, &local(&tmp, "d"), true).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!tmp.path().join("d").exists());

        assert!(matches!(
            rm(&ctx, &local(&tmp, "d"), true).await,
            Err(Error::NotFound { .. })
        ));
        ctx.pool.close().await;
    }

    #[tokio::test]
    async fn test_lock_unlock_through_token_cache() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("locks")).unwrap();
        let ctx = Context::for_tests(tmp.path());
        let target = local(&tmp, "locks/job");
        let cancel = CancellationToken::new();

        lock(&ctx, &target, Duration::from_secs(60), &cancel).await.unwrap();
        assert!(tmp.path().join("locks/job").exists());

        unlock(&ctx, &target).await.unwrap();
        assert!(!tmp.path().join("locks/job").exists());
        assert!(matches!(
            unlock(&ctx, &target).await,
            Err(Error::LockTokenMismatch { .. })
        ));

        assert!(lock(&ctx, &local(&tmp, "locks"), Duration::from_secs(60), &cancel)
            .await
            .is_err());
        ctx.pool.close().await;
    }
}
