use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_threads: usize,
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);
        Self {
            worker_threads,
            thread_name: "tile-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("failed to start worker runtime: {0}")]
    Runtime(String),
    #[error("worker task {0:?} was aborted")]
    Aborted(TaskId),
    #[error("worker task {0:?} panicked")]
    Panicked(TaskId),
}

enum Backend {
    Owned(Runtime),
    Shared(Handle),
}

/// Runs decode jobs away from the caller's task.
///
/// Either owns a dedicated multi-thread runtime, or shares an existing one
/// through its handle.
pub struct WorkerDispatcher {
    backend: Option<Backend>,
    next_id: AtomicU64,
}

impl WorkerDispatcher {
    pub fn new(config: &WorkerConfig) -> Result<Self, DispatchError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| DispatchError::Runtime(e.to_string()))?;
        debug!(
            worker_threads = config.worker_threads.max(1),
            "worker runtime started"
        );
        Ok(Self {
            backend: Some(Backend::Owned(runtime)),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            backend: Some(Backend::Shared(handle)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Shares the runtime the caller is running on.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::with_handle(Handle::current())
    }

    fn handle(&self) -> Option<&Handle> {
        match self.backend.as_ref()? {
            Backend::Owned(rt) => Some(rt.handle()),
            Backend::Shared(h) => Some(h),
        }
    }

    /// Starts `job` on a worker. The result is delivered through the returned
    /// future; dropping it detaches the job.
    pub fn run<F>(&self, job: F) -> Dispatched<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = self.handle().map(|h| h.spawn(job));
        Dispatched { id, handle }
    }

    /// Runs a CPU-bound closure on the blocking pool.
    pub fn run_blocking<F, T>(&self, job: F) -> Dispatched<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = self.handle().map(|h| h.spawn_blocking(job));
        Dispatched { id, handle }
    }
}

impl Drop for WorkerDispatcher {
    fn drop(&mut self) {
        if let Some(Backend::Owned(runtime)) = self.backend.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.backend {
            Some(Backend::Owned(_)) => "owned",
            Some(Backend::Shared(_)) => "shared",
            None => "shut down",
        };
        f.debug_struct("WorkerDispatcher")
            .field("backend", &backend)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pending result of a dispatched job.
#[derive(Debug)]
pub struct Dispatched<T> {
    id: TaskId,
    handle: Option<JoinHandle<T>>,
}

impl<T> Dispatched<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn abort(&self) {
        if let Some(h) = &self.handle {
            h.abort();
        }
    }
}

impl<T> Future for Dispatched<T> {
    type Output = Result<T, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        match self.handle.as_mut() {
            None => Poll::Ready(Err(DispatchError::Aborted(id))),
            Some(handle) => Pin::new(handle).poll(cx).map(|res| {
                res.map_err(|e| {
                    if e.is_cancelled() {
                        DispatchError::Aborted(id)
                    } else {
                        DispatchError::Panicked(id)
                    }
                })
            }),
        }
    }
}
