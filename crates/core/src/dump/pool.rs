//! Bounded worker pool.
//!
//! A fixed number of workers pull tasks from a bounded queue. The producer
//! blocks while the queue is full, so task generation is throttled to
//! worker throughput. A failing or timed-out task never cancels its
//! siblings. Results travel back over a channel and are collected on the
//! caller's task; workers never touch shared aggregation state.
//!
//! Shutdown: once every result is in (the join barrier), the pool cancels
//! its [`CancellationToken`]; idle workers observe it and exit cleanly.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default upper bound on concurrent workers.
pub const DEFAULT_MAX_WORKERS: usize = 20;

/// Default capacity of the task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// The job exceeded the pool's per-task timeout and was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task exceeded its {}s timeout", .timeout.as_secs_f64())]
pub struct TaskTimedOut {
    pub timeout: Duration,
}

/// Result of one task, as seen by the pool.
#[derive(Debug)]
pub struct PoolResult<T, R> {
    pub task: T,
    pub outcome: Result<R, TaskTimedOut>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    max_workers: usize,
    queue_capacity: usize,
    task_timeout: Duration,
}

impl WorkerPool {
    pub fn new(max_workers: usize, queue_capacity: usize, task_timeout: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            queue_capacity: queue_capacity.max(1),
            task_timeout,
        }
    }

    /// Workers actually spawned for `task_count` tasks.
    pub fn worker_count(&self, task_count: usize) -> usize {
        self.max_workers.min(task_count)
    }

    /// Run `job` over every task and return one result per task, in
    /// completion order.
    ///
    /// A job that panics loses its result; the returned vector is then
    /// shorter than the input and callers must count the gap as failures.
    pub async fn run<T, R, F, Fut>(&self, tasks: Vec<T>, job: F) -> Vec<PoolResult<T, R>>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.worker_count(total);

        let (task_tx, task_rx) = mpsc::channel::<T>(self.queue_capacity);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let job = Arc::new(job);

        tracing::debug!(
            tasks = total,
            workers,
            queue_capacity = self.queue_capacity,
            "Starting worker pool",
        );

        let producer = tokio::spawn(async move {
            for task in tasks {
                if task_tx.send(task).await.is_err() {
                    break;
                }
            }
        });

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(worker_loop(
                worker_id,
                Arc::clone(&task_rx),
                result_tx.clone(),
                Arc::clone(&job),
                cancel.clone(),
                self.task_timeout,
            ));
        }
        drop(result_tx);

        // Join barrier: every task has reported, or every worker is gone.
        let mut results = Vec::with_capacity(total);
        while results.len() < total {
            match result_rx.recv().await {
                Some(result) => results.push(result),
                None => break,
            }
        }

        cancel.cancel();
        if let Err(e) = producer.await {
            tracing::error!(error = %e, "Task producer failed");
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Pool worker panicked");
            }
        }

        if results.len() < total {
            tracing::error!(
                expected = total,
                received = results.len(),
                "Worker pool lost task results",
            );
        }
        results
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_WORKERS,
            DEFAULT_QUEUE_CAPACITY,
            Duration::from_secs(3600),
        )
    }
}

async fn worker_loop<T, R, F, Fut>(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<T>>>,
    results: mpsc::UnboundedSender<PoolResult<T, R>>,
    job: Arc<F>,
    cancel: CancellationToken,
    task_timeout: Duration,
) where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            task = async { queue.lock().await.recv().await } => task,
        };
        // Queue closed and drained, or stop requested.
        let Some(task) = next else { break };

        let start = Instant::now();
        let outcome = tokio::time::timeout(task_timeout, (*job)(task.clone()))
            .await
            .map_err(|_| TaskTimedOut {
                timeout: task_timeout,
            });
        let result = PoolResult {
            task,
            outcome,
            duration: start.elapsed(),
        };
        if results.send(result).is_err() {
            break;
        }
    }
    tracing::debug!(worker_id, "Pool worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
