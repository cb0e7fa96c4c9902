//! Sync engine and orchestration

pub mod diff;
pub mod execute;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::locator::{self, Locator};
use crate::storage::ObjectStore;
use crate::types::{Resource, ResourceKind};
use diff::{AttrMap, DiffOptions, SyncPlan};
use execute::{CopyItem, Executor};

pub use execute::Route;

/// Options of one sync run
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Descend into sub-directories
    pub recursive: bool,
    /// Remove destination objects absent from the source
    pub delete: bool,
    /// Compare and verify CRC32C
    pub force_checksum: bool,
}

/// What a sync run did
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// Relative paths copied
    pub copied: Vec<String>,
    /// Relative paths deleted
    pub deleted: Vec<String>,
    /// Number of source entries already up to date
    pub unchanged: usize,
    /// Bytes copied
    pub bytes: u64,
}

/// Where relative paths land on one side of a sync
enum Root {
    /// Under a directory prefix
    Dir(Locator),
    /// Exactly one object
    Exact(Locator),
}

impl Root {
    fn locate(&self, rel: &str) -> Locator {
        match self {
            Root::Dir(dir) => dir.with_path(locator::join(&dir.path, rel)),
            Root::Exact(loc) => loc.clone(),
        }
    }
}

/// The main sync engine
pub struct SyncEngine {
    ctx: Context,
}

impl SyncEngine {
    pub fn new(ctx: &Context) -> Self {
        Self { ctx: ctx.clone() }
    }

    /// Make `dst` match `src`
    pub async fn run(&self, src: &Locator, dst: &Locator, options: SyncOptions) -> Result<SyncReport> {
        let src_store = self.ctx.store_for(src).await?;
        let dst_store = self.ctx.store_for(dst).await?;
        let source = Resource::resolve(src_store.as_ref(), src.clone()).await?;

        tracing::info!(src = %src, dst = %dst, "Scanning");

        let (src_root, dst_root, plan) = match source.kind {
            ResourceKind::Invalid if options.delete => {
                tracing::info!(src = %src, "Source does not exist, purging destination");
                let dst_root = Root::Dir(as_dir(dst));
                let dest = list_map(dst_store.as_ref(), dst, options.recursive).await?;
                (Root::Exact(src.clone()), dst_root, diff::purge(&dest))
            }
            ResourceKind::Invalid => return Err(Error::not_found(src.to_string())),
            ResourceKind::Object(attrs) => {
                let name = locator::file_name(&src.path).to_string();
                let attrs = attrs.with_relative_path(name.clone());
                let source_map: AttrMap = [(name.clone(), attrs)].into_iter().collect();

                let dst_root = if dst.path.ends_with('/')
                    || dst_store.is_directory(&dst.bucket, &dst.path).await?
                {
                    Root::Dir(as_dir(dst))
                } else {
                    Root::Exact(dst.clone())
                };
                let target = dst_root.locate(&name);
                let dest_map: AttrMap = dst_store
                    .attributes(&target.bucket, &target.path)
                    .await?
                    .map(|a| (name.clone(), a.with_relative_path(name.clone())))
                    .into_iter()
                    .collect();

                let plan = diff::compute(&source_map, &dest_map, diff_options(options)).await?;
                (Root::Exact(src.clone()), dst_root, plan)
            }
            ResourceKind::Directory => {
                let source_map = list_map(src_store.as_ref(), src, options.recursive).await?;
                let dest_map = list_map(dst_store.as_ref(), dst, options.recursive).await?;
                tracing::info!(
                    source = source_map.len(),
                    dest = dest_map.len(),
                    "Scan complete"
                );
                let plan = diff::compute(&source_map, &dest_map, diff_options(options)).await?;
                (Root::Dir(as_dir(src)), Root::Dir(as_dir(dst)), plan)
            }
        };

        self.execute(&src_root, &dst_root, dst, plan, options).await
    }

    async fn execute(
        &self,
        src_root: &Root,
        dst_root: &Root,
        dst: &Locator,
        plan: SyncPlan,
        options: SyncOptions,
    ) -> Result<SyncReport> {
        let report = SyncReport {
            copied: plan.copy.iter().map(|a| a.relative_path.clone()).collect(),
            deleted: plan.delete.iter().map(|a| a.relative_path.clone()).collect(),
            unchanged: plan.unchanged.len(),
            bytes: plan.copy_bytes(),
        };

        tracing::info!(
            copy = report.copied.len(),
            delete = report.deleted.len(),
            unchanged = report.unchanged,
            "Executing plan"
        );

        let executor = Executor::new(&self.ctx, dst, options.force_checksum);
        let items = report
            .copied
            .iter()
            .map(|rel| CopyItem::new(src_root.locate(rel), dst_root.locate(rel)))
            .collect();
        let copied = executor.copy_all(items).await;

        // The staging area goes even when a copy failed
        let cleaned = executor.finish().await;
        copied?;
        cleaned?;

        if options.delete {
            let targets = report.deleted.iter().map(|rel| dst_root.locate(rel)).collect();
            executor.delete_all(targets).await?;
        }

        Ok(report)
    }
}

fn diff_options(options: SyncOptions) -> DiffOptions {
    DiffOptions {
        force_checksum: options.force_checksum,
        delete: options.delete,
    }
}

fn as_dir(loc: &Locator) -> Locator {
    loc.with_path(locator::as_directory(&loc.path))
}

/// Objects under `loc`, keyed by path relative to it
async fn list_map(store: &dyn ObjectStore, loc: &Locator, recursive: bool) -> Result<AttrMap> {
    let resources = store
        .list_prefix(&loc.bucket, &locator::as_directory(&loc.path), recursive)
        .await?;
    Ok(diff::build_map(resources))
}
