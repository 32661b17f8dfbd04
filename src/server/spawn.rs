//! Strategies for running request tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Decides where a request's application task runs.
pub trait Spawner: Send + Sync {
    fn spawn(&self, task: Task);
}

/// One runtime task per request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskPerRequest;

impl Spawner for TaskPerRequest {
    fn spawn(&self, task: Task) {
        tokio::spawn(task);
    }
}

/// A fixed set of workers draining a shared queue.
///
/// Bounds how many application calls are in flight at once. Tasks start in
/// submission order.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Task>,
    workers: usize,
}

impl WorkerPool {
    /// Starts `workers` worker tasks on the current runtime.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        for id in 0..workers {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let task = rx.lock().await.recv().await;
                    match task {
                        Some(task) => task.await,
                        None => break,
                    }
                }
                tracing::debug!(worker = id, "Worker stopped");
            });
        }

        Self { tx, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Spawner for WorkerPool {
    fn spawn(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("Worker pool is shut down; dropping task");
        }
    }
}
