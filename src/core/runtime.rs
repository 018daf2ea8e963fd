//! Long-running worker supervision.
//!
//! A [`WorkerSet`] owns the shutdown signal of a process:
//! - Each worker runs with a [`Context`] canceled on shutdown
//! - A worker failing with a non-shutdown error is restarted after a backoff
//! - Shutdown signals every worker and waits for them to return

use crate::core::context::Context;
use crate::core::error::StoreResult;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Boxed future of a worker run.
pub type WorkerFuture = Pin<Box<dyn Future<Output = StoreResult<()>> + Send>>;

/// A restartable long-running job.
pub trait Worker: Send + Sync + 'static {
    /// Run until `ctx` ends. Returning `Ok` means the worker is done.
    fn run(&self, ctx: Context) -> WorkerFuture;
}

impl<F, Fut> Worker for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StoreResult<()>> + Send + 'static,
{
    fn run(&self, ctx: Context) -> WorkerFuture {
        Box::pin(self(ctx))
    }
}

/// Restart backoff of a [`WorkerSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

/// Named workers sharing one shutdown signal.
pub struct WorkerSet {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    backoff: Backoff,
    restarts: Arc<AtomicU64>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet")
            .field("backoff", &self.backoff)
            .field("workers", &self.handles.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

impl WorkerSet {
    pub fn new(backoff: Backoff) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            backoff,
            restarts: Arc::new(AtomicU64::new(0)),
            handles: Vec::new(),
        }
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// A context that is canceled on shutdown.
    pub fn context(&self) -> Context {
        Context::background().with_shutdown(self.shutdown_rx.clone())
    }

    /// Restarts across all workers so far.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Spawn `worker` under `name`.
    pub fn spawn(&mut self, name: impl Into<String>, worker: impl Worker) {
        let name = name.into();
        let shutdown = self.shutdown_rx.clone();
        let backoff = self.backoff;
        let restarts = self.restarts.clone();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            supervise(task_name, worker, shutdown, backoff, restarts).await;
        });
        self.handles.push((name, handle));
    }

    /// Signal shutdown and wait up to `grace` for every worker.
    pub async fn shutdown(self, grace: Duration) {
        tracing::info!(workers = self.handles.len(), "stopping workers");
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => tracing::debug!(worker = %name, "worker joined"),
                Ok(Err(e)) => tracing::warn!(worker = %name, error = %e, "worker task panicked"),
                Err(_) => tracing::warn!(worker = %name, "worker stop timed out"),
            }
        }
    }
}

async fn supervise<W: Worker>(
    name: String,
    worker: W,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
    restarts: Arc<AtomicU64>,
) {
    let ctx = Context::background().with_shutdown(shutdown);
    let mut wait = backoff.initial;
    tracing::info!(worker = %name, "worker started");
    loop {
        match worker.run(ctx.clone()).await {
            Ok(()) => break,
            Err(e) if e.is_shutdown() || ctx.err().is_some() => break,
            Err(e) => {
                tracing::warn!(worker = %name, error = %e, backoff_ms = wait.as_millis() as u64, "worker failed, restarting");
                if ctx.sleep(wait).await.is_err() {
                    break;
                }
                restarts.fetch_add(1, Ordering::Relaxed);
                wait = (wait * 2).min(backoff.max);
            }
        }
    }
    tracing::info!(worker = %name, "worker stopped");
}
