//! Process-wide worker pool and batch fan-out
//!
//! One rayon pool is built at start-up and shared by every request. Batches
//! fan out over it with results kept in input order; a panic inside one item
//! becomes that item's failure and never touches its siblings. Callers may
//! pass a [`CancellationToken`]: items that have not started when it fires are
//! reported as cancelled instead of being run.

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::PipelineError;
use crate::generate::Thumbnail;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("job cancelled")]
    Cancelled,
    #[error("worker dropped the job without replying")]
    Dropped,
}

impl DispatchError {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(%message, "worker job panicked");
        DispatchError::Panicked(message)
    }
}

/// Bounded pool of worker threads for decode, resize, encode and cache I/O
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("thumbnail-worker-{}", i))
            .build()
            .context("Failed to build worker pool")?;
        Ok(Self { pool, size })
    }

    /// `min(32, cores + 4)`: the work is as much I/O as it is compute
    pub fn default_size() -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores + 4).min(32)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `worker` over every item on the pool, blocking until all are done.
    /// `results[i]` always belongs to `items[i]`.
    pub fn run_batch<T, R, F>(
        &self,
        items: &[T],
        cancel: &CancellationToken,
        worker: F,
    ) -> Vec<Result<R, DispatchError>>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if cancel.is_cancelled() {
                        return Err(DispatchError::Cancelled);
                    }
                    panic::catch_unwind(AssertUnwindSafe(|| worker(item))).map_err(DispatchError::from_panic)
                })
                .collect()
        })
    }

    /// Run one job on the pool and await its result without blocking the
    /// async caller. Resolves early with `Cancelled` when the token fires; the
    /// job sees the same token and can stop early.
    pub async fn spawn<F, R>(&self, cancel: CancellationToken, job: F) -> Result<R, DispatchError>
    where
        F: FnOnce(&CancellationToken) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let token = cancel.clone();

        self.pool.spawn(move || {
            let outcome = if token.is_cancelled() {
                Err(DispatchError::Cancelled)
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| job(&token))).map_err(DispatchError::from_panic)
            };
            // The receiver is gone if the caller stopped waiting
            let _ = tx.send(outcome);
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            reply = rx => reply.unwrap_or(Err(DispatchError::Dropped)),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("size", &self.size).finish()
    }
}

/// Outcome of one image in a batch
#[derive(Debug)]
pub struct JobResult {
    pub path: PathBuf,
    pub outcome: Result<Thumbnail, PipelineError>,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn from_cache(&self) -> bool {
        matches!(&self.outcome, Ok(thumbnail) if thumbnail.from_cache)
    }
}

/// Results of a batch run, in input order, with summary counters
#[derive(Debug)]
pub struct BatchReport {
    pub results: Vec<JobResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn from_results(results: Vec<JobResult>, elapsed: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let cache_hits = results.iter().filter(|r| r.from_cache()).count();
        Self {
            failed: results.len() - succeeded,
            results,
            succeeded,
            cache_hits,
            elapsed,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Successful items per second, 0.0 when no measurable time elapsed
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            0.0
        } else {
            self.succeeded as f64 / secs
        }
    }
}

/// Shared progress counter for long batches, readable from other threads
#[derive(Debug, Default)]
pub struct Progress {
    completed: AtomicUsize,
}

impl Progress {
    pub fn record(&self) -> usize {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Time a batch run and wrap its results into a report
pub fn timed_batch(run: impl FnOnce() -> Vec<JobResult>) -> BatchReport {
    let start = Instant::now();
    let results = run();
    BatchReport::from_results(results, start.elapsed())
}
