//! Execution backends.
//!
//! A backend consumes queued jobs and drives them to a terminal state (or
//! back to `Queued` on retry) by calling the compute collaborator. Three
//! interchangeable variants exist behind the [`ExecutionBackend`] trait:
//!
//! - [`pool::PoolBackend`]: a fixed-size in-process worker pool draining a
//!   bounded local queue.
//! - [`queue::QueueBackend`]: publishes to a broker; independent workers
//!   consume, execute, and write results back through the registry.
//! - [`batch::BatchBackend`]: submits to an external batch scheduler and
//!   advances job state by polling the scheduler's reported status.
//!
//! The variant is chosen by configuration through [`build_backend`]; no
//! runtime type inspection is involved.
//!
//! # Shared semantics
//!
//! All variants enforce the per-job timeout independently of the
//! collaborator (`tokio::time::timeout` around the call), retry transient
//! collaborator errors up to the job's retry budget, and honor cooperative
//! cancellation. The registry's `Queued -> Running` compare-and-swap is
//! the claim arbiter: a job cancelled while queued loses the claim and is
//! never executed.
//!
//! # Caveats
//!
//! A collaborator call that exceeds the timeout is *abandoned*, not
//! killed: the future is dropped, but work already handed to an external
//! process may run to completion on its own. Likewise a `Running` job
//! whose collaborator completes after a cancel request may still report
//! `Succeeded`; the cancel flag is only observed at loop checkpoints.

pub mod batch;
pub mod pool;
pub mod queue;

mod worker;


pub use worker::{AttemptOutcome, ExecDeps};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobId};
use crate::registry::RegistryError;

/// Errors from execution backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The local queue is full and the backend is configured to fail fast.
    #[error("execution queue is full")]
    QueueFull,

    /// The backend has shut down.
    #[error("execution backend is shut down")]
    Closed,

    /// Registry interaction failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The external scheduler or broker failed.
    #[error("external system error: {0}")]
    External(String),
}

/// Strategy contract implemented by all backend variants.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Hands a `Queued` job to the backend. The backend is responsible
    /// for eventually transitioning it to a terminal state (or back to
    /// `Queued` on retry).
    async fn enqueue(&self, job: &Job) -> Result<(), BackendError>;

    /// Requests best-effort cancellation of a running job.
    ///
    /// The `Queued -> Cancelled` registry transition is the caller's job
    /// and is the atomic part; this call only raises the cooperative flag
    /// consulted at the backend's next checkpoint.
    async fn cancel(&self, job_id: &JobId);

    /// Whether the backend can confirm that a job recorded as `Running`
    /// is still alive. Consulted during startup orphan recovery; only the
    /// batch variant can answer by re-querying the external scheduler.
    async fn confirm_running(&self, _job: &Job) -> bool {
        false
    }

    /// Resumes tracking a confirmed-alive `Running` job after a restart.
    /// Only meaningful for the batch variant, which must re-arm its
    /// status polling for the job's external reference.
    async fn reattach(&self, _job: &Job) {}

    /// Stops accepting work and waits for in-flight jobs to settle.
    async fn shutdown(&self);
}

/// Behavior of `enqueue` when the local queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// `enqueue` waits for space.
    #[default]
    Block,

    /// `enqueue` fails immediately with [`BackendError::QueueFull`].
    FailFast,
}

/// Delay policy between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between attempts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff, doubling per attempt up to a cap.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (the attempt that is about to run,
    /// starting at 2 for the first retry), with up to 10% jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
            } => {
                let exp = attempt.saturating_sub(2).min(16);
                (*initial_delay * 2u32.saturating_pow(exp)).min(*max_delay)
            }
        };
        let jitter = base.mul_f64(rand::random::<f64>() * 0.1);
        base + jitter
    }
}

/// Shared cooperative-cancellation flag set.
///
/// Cancelling a `Queued` job doesn't need this (the claim CAS arbitrates);
/// the flag set exists for `Running` jobs, where workers consult it at
/// checkpoints.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    flags: Arc<Mutex<HashSet<JobId>>>,
}

impl CancelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the cancel flag for a job.
    pub fn request(&self, job_id: &JobId) {
        self.flags.lock().unwrap().insert(job_id.clone());
    }

    /// Whether cancellation was requested for a job.
    #[must_use]
    pub fn is_requested(&self, job_id: &JobId) -> bool {
        self.flags.lock().unwrap().contains(job_id)
    }

    /// Clears the flag once the job settles.
    pub fn clear(&self, job_id: &JobId) {
        self.flags.lock().unwrap().remove(job_id);
    }
}

/// Configuration for [`build_backend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process worker pool.
    Pool {
        /// Number of worker tasks.
        workers: usize,

        /// Bounded local queue depth.
        queue_depth: usize,

        /// Full-queue behavior.
        #[serde(default)]
        backpressure: Backpressure,
    },

    /// Distributed queue over a broker.
    Queue {
        /// Number of consumer workers to spawn against the broker.
        consumers: usize,
    },

    /// External batch-scheduler submitter.
    Batch {
        /// Scheduler status poll interval.
        #[serde(with = "humantime_serde")]
        poll_interval: Duration,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Pool {
            workers: 4,
            queue_depth: 64,
            backpressure: Backpressure::Block,
        }
    }
}

/// Builds the configured backend variant.
///
/// The queue variant gets an in-memory broker; the batch variant gets the
/// supplied scheduler, or the in-memory scheduler driving the shared
/// compute collaborator when none is supplied.
#[must_use]
pub fn build_backend(
    config: &BackendConfig,
    deps: ExecDeps,
    scheduler: Option<Arc<dyn batch::BatchScheduler>>,
) -> Arc<dyn ExecutionBackend> {
    match config {
        BackendConfig::Pool {
            workers,
            queue_depth,
            backpressure,
        } => Arc::new(pool::PoolBackend::start(
            deps,
            *workers,
            *queue_depth,
            *backpressure,
        )),
        BackendConfig::Queue { consumers } => {
            let broker = Arc::new(queue::MemoryBroker::new());
            Arc::new(queue::QueueBackend::start(deps, broker, *consumers))
        }
        BackendConfig::Batch { poll_interval } => {
            let scheduler = scheduler.unwrap_or_else(|| {
                Arc::new(batch::MemoryScheduler::new(Arc::clone(&deps.compute)))
            });
            Arc::new(batch::BatchBackend::start(deps, scheduler, *poll_interval))
        }
    }
}
