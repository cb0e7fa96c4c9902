//! Copy and delete execution through the worker pool

use crate::config::STAGING_MARKER;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator, Scheme};
use crate::pool::{self, JobHandle, CHUNK_DEPTH, ITEM_DEPTH};
use crate::storage::ObjectStore;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

/// How one object gets from source to destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Local file to local file
    LocalCopy,
    /// Local file to a remote object
    Upload,
    /// Remote object to a local file (chunked)
    Download,
    /// Server-side copy within one backend
    NativeCopy,
    /// Between two backends, through a local staging file
    InterCloud,
}

impl Route {
    pub fn between(src: &Locator, dst: &Locator) -> Self {
        match (src.scheme, dst.scheme) {
            (Scheme::Local, Scheme::Local) => Route::LocalCopy,
            (Scheme::Local, _) => Route::Upload,
            (_, Scheme::Local) => Route::Download,
            (a, b) if a == b => Route::NativeCopy,
            _ => Route::InterCloud,
        }
    }

    /// Pool depth for the job; routes that wait on chunk jobs run above them
    fn depth(self) -> usize {
        match self {
            Route::Download | Route::InterCloud => ITEM_DEPTH,
            _ => CHUNK_DEPTH,
        }
    }
}

/// One object to copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyItem {
    pub src: Locator,
    pub dst: Locator,
}

impl CopyItem {
    pub fn new(src: Locator, dst: Locator) -> Self {
        Self { src, dst }
    }

    pub fn route(&self) -> Route {
        Route::between(&self.src, &self.dst)
    }
}

/// Private directory holding inter-cloud intermediates
#[derive(Debug, Clone)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Unique directory under the configured staging root, always inside a
    /// `_icw_` component
    pub fn new(root: &Path, dst: &Locator) -> Self {
        let root = if has_marker(root) {
            root.to_path_buf()
        } else {
            root.join(STAGING_MARKER)
        };

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut hasher = blake3::Hasher::new();
        hasher.update(dst.to_uri().as_bytes());
        hasher.update(nanos.to_string().as_bytes());
        let id = hex::encode(&hasher.finalize().as_bytes()[..16]);

        Self { path: root.join(id) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Staging file for one source object
    pub fn file_for(&self, src: &Locator) -> PathBuf {
        let digest = blake3::hash(src.to_uri().as_bytes());
        let name = format!(
            "{}-{}",
            hex::encode(&digest.as_bytes()[..8]),
            locator::file_name(&src.path)
        );
        self.path.join(name)
    }

    /// Remove the staging directory and everything left in it
    pub async fn remove(&self) -> Result<()> {
        if !has_marker(&self.path) {
            return Err(Error::config(format!(
                "refusing to remove {}: not a staging directory",
                self.path.display()
            )));
        }
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(
                format!("removing staging directory {}", self.path.display()),
                e,
            )),
        }
    }
}

fn has_marker(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(n) if n == STAGING_MARKER))
}

/// Dispatches copies and deletes onto the pool
pub struct Executor {
    ctx: Context,
    force_checksum: bool,
    staging: StagingDir,
}

impl Executor {
    /// Executor whose inter-cloud copies stage under a directory named for `dst`
    pub fn new(ctx: &Context, dst: &Locator, force_checksum: bool) -> Self {
        Self {
            ctx: ctx.clone(),
            force_checksum,
            staging: StagingDir::new(&ctx.config.staging_dir, dst),
        }
    }

    pub fn staging(&self) -> &StagingDir {
        &self.staging
    }

    /// Copy every item; the first failure is returned once all jobs settle
    pub async fn copy_all(&self, items: Vec<CopyItem>) -> Result<()> {
        let mut handles: Vec<JobHandle<()>> = Vec::with_capacity(items.len());
        for item in items {
            let route = item.route();
            let src_store = self.ctx.store_for(&item.src).await?;
            let dst_store = self.ctx.store_for(&item.dst).await?;
            let job = copy_one(
                self.ctx.clone(),
                src_store,
                dst_store,
                item,
                route,
                self.force_checksum,
                self.staging.clone(),
            );
            handles.push(self.ctx.pool.spawn_at_depth(route.depth(), job).await?);
        }
        pool::join_all(handles).await
    }

    /// Move every item: a native rename where the backend can, otherwise a
    /// copy followed by deleting the source
    pub async fn move_all(&self, items: Vec<CopyItem>) -> Result<()> {
        let mut handles: Vec<JobHandle<()>> = Vec::with_capacity(items.len());
        for item in items {
            let route = item.route();
            let src_store = self.ctx.store_for(&item.src).await?;
            let dst_store = self.ctx.store_for(&item.dst).await?;
            let ctx = self.ctx.clone();
            let force_checksum = self.force_checksum;
            let staging = self.staging.clone();
            let job = async move {
                if matches!(route, Route::LocalCopy | Route::NativeCopy) {
                    let CopyItem { src, dst } = &item;
                    tracing::debug!(src = %src, dst = %dst, "Moving");
                    return src_store
                        .move_object(&src.bucket, &src.path, &dst.bucket, &dst.path)
                        .await;
                }
                let src = item.src.clone();
                copy_one(ctx, src_store.clone(), dst_store, item, route, force_checksum, staging)
                    .await?;
                src_store.delete(&src.bucket, &src.path).await
            };
            handles.push(self.ctx.pool.spawn_at_depth(route.depth(), job).await?);
        }
        pool::join_all(handles).await
    }

    /// Delete every target
    pub async fn delete_all(&self, targets: Vec<Locator>) -> Result<()> {
        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let store = self.ctx.store_for(&target).await?;
            let job = async move {
                store.delete(&target.bucket, &target.path).await?;
                tracing::debug!(target = %target, "Deleted");
                Ok(())
            };
            handles.push(self.ctx.pool.spawn_at_depth(CHUNK_DEPTH, job).await?);
        }
        pool::join_all(handles).await
    }

    /// Remove the staging directory
    pub async fn finish(&self) -> Result<()> {
        self.staging.remove().await
    }
}

async fn copy_one(
    ctx: Context,
    src_store: Arc<dyn ObjectStore>,
    dst_store: Arc<dyn ObjectStore>,
    item: CopyItem,
    route: Route,
    force_checksum: bool,
    staging: StagingDir,
) -> Result<()> {
    let CopyItem { src, dst } = &item;
    tracing::debug!(src = %src, dst = %dst, route = ?route, "Copying");

    match route {
        Route::LocalCopy | Route::NativeCopy => {
            src_store
                .copy(&src.bucket, &src.path, &dst.bucket, &dst.path)
                .await
        }
        Route::Upload => {
            dst_store
                .upload(&ctx, Path::new(&src.path), &dst.bucket, &dst.path)
                .await
        }
        Route::Download => {
            src_store
                .download(
                    &ctx,
                    &src.bucket,
                    &src.path,
                    Path::new(&dst.path),
                    force_checksum,
                )
                .await
        }
        Route::InterCloud => {
            let staged = staging.file_for(src);
            src_store
                .download(&ctx, &src.bucket, &src.path, &staged, force_checksum)
                .await?;
            dst_store
                .upload(&ctx, &staged, &dst.bucket, &dst.path)
                .await?;
            fs::remove_file(&staged)
                .await
                .map_err(|e| Error::io(format!("removing {}", staged.display()), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        let local = Locator::local("/tmp/a");
        let gs = Locator::remote(Scheme::Gs, "b", "k");
        let gs2 = Locator::remote(Scheme::Gs, "other", "k");
        let s3 = Locator::remote(Scheme::S3, "b", "k");

        assert_eq!(Route::between(&local, &local), Route::LocalCopy);
        assert_eq!(Route::between(&local, &s3), Route::Upload);
        assert_eq!(Route::between(&gs, &local), Route::Download);
        assert_eq!(Route::between(&gs, &gs2), Route::NativeCopy);
        assert_eq!(Route::between(&gs, &s3), Route::InterCloud);
    }

    #[test]
    fn test_waiting_routes_run_above_chunk_depth() {
        assert_eq!(Route::Download.depth(), ITEM_DEPTH);
        assert_eq!(Route::InterCloud.depth(), ITEM_DEPTH);
        assert_eq!(Route::Upload.depth(), CHUNK_DEPTH);
    }

    #[test]
    fn test_staging_dir_always_marked() {
        let dst = Locator::remote(Scheme::S3, "b", "dir");
        let plain = StagingDir::new(Path::new("/var/tmp/scratch"), &dst);
        assert!(plain.path().starts_with("/var/tmp/scratch/_icw_"));

        let marked = StagingDir::new(Path::new("/var/tmp/_icw_"), &dst);
        assert!(marked.path().starts_with("/var/tmp/_icw_"));
        assert_eq!(marked.path().file_name().unwrap().len(), 32);

        let staged = marked.file_for(&Locator::remote(Scheme::Gs, "b", "x/data.bin"));
        assert!(staged.to_string_lossy().ends_with("-data.bin"));
        assert_eq!(staged.parent().unwrap(), marked.path());
    }

    #[tokio::test]
    async fn test_refuses_to_remove_unmarked_directory() {
        let staging = StagingDir {
            path: PathBuf::from("/definitely/not/staging"),
        };
        assert!(matches!(staging.remove().await, Err(Error::Config { .. })));
    }
}
