//! Multi-level worker pool
//!
//! Each level (depth) owns a bounded queue and `size` worker tasks. Work
//! that waits on other work must be submitted at a different depth than the
//! work it waits on, so waiting jobs never occupy the workers they need.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Byte-range jobs of a chunked transfer
pub const CHUNK_DEPTH: usize = 0;

/// Jobs that wait on chunk jobs (rename, mtime, checksum)
pub const FINALIZE_DEPTH: usize = 1;

/// Per-object pipelines that wait on a whole transfer
pub const ITEM_DEPTH: usize = 2;

/// Levels needed by the depths above
pub const DEFAULT_LEVELS: usize = 3;

/// A unit of work
pub type Job = BoxFuture<'static, ()>;

struct Level {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    size: usize,
    levels: Vec<Level>,
}

/// Fixed-size executor with independent levels; cheap to clone
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Pool {
    /// Create a pool; workers start on [`Pool::run`]
    pub fn new(size: usize, levels: usize) -> Self {
        let size = size.max(1);
        let levels = (0..levels.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::channel(size);
                Level {
                    sender: Mutex::new(Some(tx)),
                    receiver: Arc::new(AsyncMutex::new(rx)),
                    workers: Mutex::new(Vec::new()),
                }
            })
            .collect();

        Self {
            inner: Arc::new(Inner { size, levels }),
        }
    }

    /// Create and run a pool
    pub fn start(size: usize, levels: usize) -> Self {
        let pool = Self::new(size, levels);
        pool.run();
        pool
    }

    /// Spawn `size` workers on every level that has none yet
    pub fn run(&self) {
        for (depth, level) in self.inner.levels.iter().enumerate() {
            let mut workers = locked(&level.workers);
            if !workers.is_empty() {
                continue;
            }
            for id in 0..self.inner.size {
                let receiver = level.receiver.clone();
                workers.push(tokio::spawn(worker_loop(depth, id, receiver)));
            }
        }
        tracing::debug!(
            size = self.inner.size,
            levels = self.inner.levels.len(),
            "Worker pool running"
        );
    }

    /// Workers per level
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of levels
    pub fn levels(&self) -> usize {
        self.inner.levels.len()
    }

    /// Enqueue a job at depth 0
    pub async fn add<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.add_at_depth(0, job).await
    }

    /// Enqueue a job at an explicit depth; waits while the queue is full
    pub async fn add_at_depth<F>(&self, depth: usize, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let level = self
            .inner
            .levels
            .get(depth)
            .ok_or_else(|| Error::worker(format!("no pool level at depth {}", depth)))?;

        let sender = locked(&level.sender)
            .clone()
            .ok_or_else(|| Error::worker("pool is closed"))?;

        sender
            .send(job.boxed())
            .await
            .map_err(|_| Error::worker("pool is closed"))
    }

    /// Enqueue a job whose result can be awaited through the returned handle
    pub async fn spawn_at_depth<F, T>(&self, depth: usize, fut: F) -> Result<JobHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.add_at_depth(depth, async move {
            let _ = tx.send(fut.await);
        })
        .await?;
        Ok(JobHandle { rx })
    }

    /// Close every level, highest depth first, and wait for its workers to drain
    pub async fn close(&self) {
        for (depth, level) in self.inner.levels.iter().enumerate().rev() {
            drop(locked(&level.sender).take());
            let workers: Vec<JoinHandle<()>> = locked(&level.workers).drain(..).collect();
            for handle in workers {
                if let Err(e) = handle.await {
                    tracing::error!(depth, error = %e, "Worker task failed");
                }
            }
        }
        tracing::debug!("Worker pool closed");
    }
}

async fn worker_loop(depth: usize, id: usize, receiver: Arc<AsyncMutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            break;
        };
        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
            tracing::error!(
                depth,
                worker = id,
                panic = %panic_message(panic.as_ref()),
                "Job panicked; worker continues"
            );
        }
    }
    tracing::trace!(depth, worker = id, "Worker exited");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of a job submitted with [`Pool::spawn_at_depth`]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobHandle<T> {
    /// Wait for the job; a job that panicked reports a worker error
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::worker("job ended without a result"))?
    }
}

/// Wait for every handle; the first error that is not a cancellation wins
pub async fn join_all(handles: Vec<JobHandle<()>>) -> Result<()> {
    let mut first_error: Option<Error> = None;
    for handle in handles {
        if let Err(e) = handle.join().await {
            let replace = match &first_error {
                None => true,
                Some(existing) => existing.is_cancelled() && !e.is_cancelled(),
            };
            if replace {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
