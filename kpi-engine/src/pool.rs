//! Worker pools for metric jobs.
//!
//! A `ThreadedPool` is built once at process start and shared by every
//! batch: it owns a dedicated runtime whose blocking threads execute the
//! jobs, plus a semaphore capping how many jobs may be queued or running at
//! the same time. Submission is all-or-nothing, so a rejected batch can be
//! replayed elsewhere without running any metric twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinSet;

use crate::config::PoolConfig;
use crate::request::MetricDescriptor;
use crate::result::MetricResult;

/// Computation of a single metric, ready to run on any thread
pub struct MetricJob {
    metric: MetricDescriptor,
    run: Box<dyn FnOnce() -> MetricResult + Send + 'static>,
}

impl MetricJob {
    pub fn new<F>(metric: MetricDescriptor, run: F) -> Self
    where
        F: FnOnce() -> MetricResult + Send + 'static,
    {
        Self {
            metric,
            run: Box::new(run),
        }
    }

    pub fn metric(&self) -> &MetricDescriptor {
        &self.metric
    }

    pub fn run(self) -> MetricResult {
        (self.run)()
    }
}

impl fmt::Debug for MetricJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricJob").field("metric", &self.metric.id).finish()
    }
}

/// Jobs accepted by a pool, with the metric each task computes
pub struct SpawnedTasks {
    pub join_set: JoinSet<MetricResult>,
    pub task_metrics: HashMap<tokio::task::Id, MetricDescriptor>,
}

impl SpawnedTasks {
    fn new() -> Self {
        Self {
            join_set: JoinSet::new(),
            task_metrics: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Saturated,
    ShutDown,
}

impl RejectReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Saturated => "saturated",
            RejectReason::ShutDown => "shut_down",
        }
    }
}

/// A refused submission. None of the jobs were started; they are handed back.
pub struct Rejected {
    pub reason: RejectReason,
    pub jobs: Vec<MetricJob>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

pub trait WorkerPool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts every job or none of them. Must be called from within a tokio runtime.
    fn submit_all(&self, jobs: Vec<MetricJob>) -> Result<SpawnedTasks, Rejected>;
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Failed to start worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Bounded pool of OS threads shared by all batches of the process
pub struct ThreadedPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    threads: usize,
    capacity: usize,
}

impl ThreadedPool {
    pub fn new(config: &PoolConfig) -> Result<Self, PoolError> {
        let threads = config.thread_count();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("kpi-worker")
            .build()?;
        let handle = runtime.handle().clone();

        tracing::info!(
            threads,
            queue_capacity = config.queue_capacity,
            "Started metric worker pool"
        );

        Ok(ThreadedPool {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(config.queue_capacity)),
            threads,
            capacity: config.queue_capacity,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of jobs that can still be accepted right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stops accepting jobs. Jobs already accepted run to completion.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

impl WorkerPool for ThreadedPool {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn submit_all(&self, jobs: Vec<MetricJob>) -> Result<SpawnedTasks, Rejected> {
        let mut permits = Vec::with_capacity(jobs.len());
        for _ in 0..jobs.len() {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(TryAcquireError::NoPermits) => {
                    return Err(Rejected {
                        reason: RejectReason::Saturated,
                        jobs,
                    });
                }
                Err(TryAcquireError::Closed) => {
                    return Err(Rejected {
                        reason: RejectReason::ShutDown,
                        jobs,
                    });
                }
            }
        }

        let mut spawned = SpawnedTasks::new();
        for (job, permit) in jobs.into_iter().zip(permits) {
            let metric = job.metric().clone();
            let abort_handle = spawned.join_set.spawn_blocking_on(
                move || {
                    let _permit = permit;
                    job.run()
                },
                &self.handle,
            );
            spawned.task_metrics.insert(abort_handle.id(), metric);
        }

        Ok(spawned)
    }
}

impl Drop for ThreadedPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Runs each job on the submitting thread, in submission order.
///
/// Deterministic stand-in for `ThreadedPool`, mostly useful in tests.
#[derive(Debug, Default)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn submit_all(&self, jobs: Vec<MetricJob>) -> Result<SpawnedTasks, Rejected> {
        let mut spawned = SpawnedTasks::new();
        for job in jobs {
            let metric = job.metric().clone();
            let result = job.run();
            let abort_handle = spawned.join_set.spawn(std::future::ready(result));
            spawned.task_metrics.insert(abort_handle.id(), metric);
        }
        Ok(spawned)
    }
}
