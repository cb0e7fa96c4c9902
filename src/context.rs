//! Per-invocation context: configuration, backend registry, worker pool and
//! progress factory, passed explicitly into every operation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::locator::{Locator, Scheme};
use crate::pool::{Pool, DEFAULT_LEVELS};
use crate::progress::ProgressFactory;
use crate::storage::{r2_store, GcsStore, LocalStore, ObjectStore, S3Store};
use crate::types::Resource;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each scheme to its backend instance
#[derive(Clone, Default)]
pub struct Registry {
    stores: HashMap<Scheme, Arc<dyn ObjectStore>>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The local filesystem plus every cloud backend; clients are built on first use
    pub fn standard(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(
            Scheme::Local,
            Arc::new(LocalStore::with_checksum_cache(&config.effective_cache_dir())),
        );
        registry.register(Scheme::Gs, Arc::new(GcsStore::new()));
        registry.register(Scheme::S3, Arc::new(S3Store::new()));
        registry.register(Scheme::R2, Arc::new(r2_store()));
        registry
    }

    /// Register (or replace) the backend serving `scheme`
    pub fn register(&mut self, scheme: Scheme, store: Arc<dyn ObjectStore>) {
        self.stores.insert(scheme, store);
    }

    /// Builder form of [`Registry::register`]
    pub fn with(mut self, scheme: Scheme, store: Arc<dyn ObjectStore>) -> Self {
        self.register(scheme, store);
        self
    }

    pub fn get(&self, scheme: Scheme) -> Result<Arc<dyn ObjectStore>> {
        self.stores.get(&scheme).cloned().ok_or_else(|| {
            Error::config(format!(
                "no backend registered for {}",
                scheme.backend_name()
            ))
        })
    }
}

/// Everything an operation needs; cheap to clone
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub pool: Pool,
    pub progress: ProgressFactory,
}

impl Context {
    /// Context with the standard backends; must be called inside a runtime
    pub fn new(config: Config) -> Self {
        let registry = Registry::standard(&config);
        Self::with_registry(config, registry)
    }

    /// Context with an explicit registry
    pub fn with_registry(config: Config, registry: Registry) -> Self {
        let pool = Pool::start(config.effective_workers(), DEFAULT_LEVELS);
        let progress = ProgressFactory::new(config.progress);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            pool,
            progress,
        }
    }

    /// Backend for a locator, initialized for its bucket
    pub async fn store_for(&self, locator: &Locator) -> Result<Arc<dyn ObjectStore>> {
        let store = self.registry.get(locator.scheme)?;
        store.init(&locator.bucket).await?;
        Ok(store)
    }

    /// Classify a locator against its backend
    pub async fn resolve(&self, locator: &Locator) -> Result<Resource> {
        let store = self.store_for(locator).await?;
        Resource::resolve(store.as_ref(), locator.clone()).await
    }

    /// Close the pool and settle the command's result
    ///
    /// In embedded mode the error is returned to the caller; otherwise it is
    /// logged and the process exits with status 1.
    pub async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        self.pool.close().await;
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.config.embedded => Err(e),
            Err(e) => {
                tracing::error!(error = %e, "Command failed");
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    /// Embedded context over the local backend, rooted in a scratch directory
    #[cfg(test)]
    pub(crate) fn for_tests(dir: &std::path::Path) -> Self {
        let config = Config {
            multi_thread: true,
            concurrency: 4,
            embedded: true,
            staging_dir: dir.join(crate::config::STAGING_MARKER),
            cache_dir: Some(dir.join("cache")),
            ..Config::default()
        };
        let registry = Registry::new().with(Scheme::Local, Arc::new(LocalStore::new()));
        Self::with_registry(config, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unregistered_scheme_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let ctx = Context::for_tests(tmp.path());
        let loc = Locator::remote(Scheme::Gs, "bucket", "key");
        assert!(matches!(
            ctx.store_for(&loc).await,
            Err(Error::Config { .. })
        ));
        ctx.pool.close().await;
    }

    #[tokio::test]
    async fn test_resolve_classifies_once() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f.txt"), b"abc").unwrap();
        let ctx = Context::for_tests(tmp.path());

        let root = tmp.path().to_string_lossy().into_owned();
        let file = Locator::local(format!("{}/f.txt", root));
        let missing = Locator::local(format!("{}/nope", root));

        let resource = ctx.resolve(&file).await.unwrap();
        assert!(matches!(&resource.kind, ResourceKind::Object(a) if a.size == 3));
        assert!(ctx.resolve(&Locator::local(root)).await.unwrap().is_directory());
        assert!(!ctx.resolve(&missing).await.unwrap().is_valid());
        ctx.pool.close().await;
    }

    #[tokio::test]
    async fn test_finish_returns_error_when_embedded() {
        let tmp = TempDir::new().unwrap();
        let ctx = Context::for_tests(tmp.path());
        let result: Result<()> = ctx.finish(Err(Error::not_found("x"))).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
