//! External batch-scheduler backend.
//!
//! Jobs are handed to a [`BatchScheduler`] and tracked by an external
//! reference. A single monitor task polls the scheduler at a fixed
//! interval and advances job state from the reported status; the
//! scheduler never writes to the registry itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audit::{self, AuditEvent};
use crate::compute::ComputeCollaborator;
use crate::crypto::digest_hex;
use crate::job::{FailureKind, Job, JobFailure, JobId, JobStatus};
use crate::registry::{RegistryError, TransitionMetadata};

use super::worker::ExecDeps;
use super::{BackendError, ExecutionBackend};

/// Status an external scheduler reports for a submitted job.
#[derive(Debug, Clone)]
pub enum BatchStatus {
    /// Accepted but not yet started.
    Pending,

    /// Currently executing.
    Running,

    /// Finished with output.
    Succeeded {
        /// Raw result bytes.
        output: Vec<u8>,
    },

    /// Finished unsuccessfully.
    Failed {
        /// Scheduler-reported failure message.
        message: String,

        /// Whether a resubmission could plausibly succeed.
        transient: bool,
    },

    /// The scheduler no longer knows this reference.
    Unknown,
}

/// External scheduler contract.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submits a job and returns the scheduler's reference for it.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler rejects the submission or is unreachable.
    async fn submit(&self, job: &Job) -> Result<String, BackendError>;

    /// Reports the current status of a submitted job.
    ///
    /// # Errors
    ///
    /// Fails when the scheduler is unreachable; the caller keeps polling.
    async fn status(&self, external_ref: &str) -> Result<BatchStatus, BackendError>;

    /// Requests cancellation of a submitted job. Best effort.
    async fn cancel(&self, external_ref: &str);
}

struct Tracked {
    external_ref: String,
    deadline: Instant,
}

type TrackedMap = Arc<tokio::sync::Mutex<HashMap<JobId, Tracked>>>;
type ResubmitList = Arc<tokio::sync::Mutex<Vec<JobId>>>;

/// Batch-scheduler backend with a polling status monitor.
pub struct BatchBackend {
    deps: ExecDeps,
    scheduler: Arc<dyn BatchScheduler>,
    tracked: TrackedMap,
    resubmit: ResubmitList,
    shutdown_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BatchBackend {
    /// Spawns the status monitor and returns the running backend.
    #[must_use]
    pub fn start(
        deps: ExecDeps,
        scheduler: Arc<dyn BatchScheduler>,
        poll_interval: Duration,
    ) -> Self {
        let tracked: TrackedMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let resubmit: ResubmitList = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let monitor = {
            let deps = deps.clone();
            let scheduler = Arc::clone(&scheduler);
            let tracked = Arc::clone(&tracked);
            let resubmit = Arc::clone(&resubmit);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    let retries: Vec<JobId> = std::mem::take(&mut *resubmit.lock().await);
                    for job_id in retries {
                        if let Err(err) =
                            dispatch(&deps, scheduler.as_ref(), &tracked, &job_id).await
                        {
                            tracing::warn!(job_id = %job_id, error = %err, "resubmission failed");
                        }
                    }
                    poll_tracked(&deps, scheduler.as_ref(), &tracked, &resubmit).await;
                }
            })
        };

        Self {
            deps,
            scheduler,
            tracked,
            resubmit,
            shutdown_tx,
            monitor: Mutex::new(Some(monitor)),
        }
    }
}

/// Claims a queued job and hands it to the scheduler.
async fn dispatch(
    deps: &ExecDeps,
    scheduler: &dyn BatchScheduler,
    tracked: &TrackedMap,
    job_id: &JobId,
) -> Result<(), BackendError> {
    let job = match deps
        .registry
        .claim_for_run(job_id, TransitionMetadata::start())?
    {
        Some(job) => job,
        None => return Ok(()),
    };

    if deps.cancels.is_requested(job_id) {
        deps.registry.transition(
            job_id,
            JobStatus::Running,
            JobStatus::Cancelled,
            TransitionMetadata::cancelled("cancel observed before dispatch"),
        )?;
        deps.cancels.clear(job_id);
        return Ok(());
    }

    match scheduler.submit(&job).await {
        Ok(external_ref) => {
            deps.registry.set_external_ref(job_id, &external_ref)?;
            // The dispatch event marks the scheduler's acceptance; a
            // rejected submission leaves no dispatch record.
            deps.registry
                .audit_log()
                .append(AuditEvent::new(
                    audit::JOB_DISPATCHED,
                    &job.correlation_id,
                    &job.identity,
                    digest_hex(&job.spec_digest),
                    serde_json::json!({
                        "job_id": job.id.as_str(),
                        "external_ref": external_ref,
                        "attempt": job.attempt,
                    }),
                ))
                .map_err(RegistryError::Audit)?;
            tracked.lock().await.insert(
                job_id.clone(),
                Tracked {
                    external_ref,
                    deadline: Instant::now() + job.timeout(),
                },
            );
            Ok(())
        }
        Err(err) => {
            settle_failure(
                deps,
                &job,
                &err.to_string(),
                true,
                FailureKind::EnvironmentUnavailable,
            )
            .await;
            Ok(())
        }
    }
}

/// Polls every tracked job once and advances its state.
async fn poll_tracked(
    deps: &ExecDeps,
    scheduler: &dyn BatchScheduler,
    tracked: &TrackedMap,
    resubmit: &ResubmitList,
) {
    let snapshot: Vec<(JobId, String, Instant)> = tracked
        .lock()
        .await
        .iter()
        .map(|(id, t)| (id.clone(), t.external_ref.clone(), t.deadline))
        .collect();

    for (job_id, external_ref, deadline) in snapshot {
        if let Err(err) =
            poll_one(deps, scheduler, tracked, resubmit, &job_id, &external_ref, deadline).await
        {
            tracing::warn!(job_id = %job_id, error = %err, "status poll failed");
        }
    }
}

async fn poll_one(
    deps: &ExecDeps,
    scheduler: &dyn BatchScheduler,
    tracked: &TrackedMap,
    resubmit: &ResubmitList,
    job_id: &JobId,
    external_ref: &str,
    deadline: Instant,
) -> Result<(), BackendError> {
    if deps.cancels.is_requested(job_id) {
        scheduler.cancel(external_ref).await;
        deps.registry.transition(
            job_id,
            JobStatus::Running,
            JobStatus::Cancelled,
            TransitionMetadata::cancelled("operator cancel"),
        )?;
        deps.cancels.clear(job_id);
        tracked.lock().await.remove(job_id);
        return Ok(());
    }

    match scheduler.status(external_ref).await? {
        BatchStatus::Pending | BatchStatus::Running => {
            if Instant::now() >= deadline {
                scheduler.cancel(external_ref).await;
                deps.registry.transition(
                    job_id,
                    JobStatus::Running,
                    JobStatus::TimedOut,
                    TransitionMetadata::timed_out(),
                )?;
                tracked.lock().await.remove(job_id);
            }
        }
        BatchStatus::Succeeded { output } => {
            let handle = deps
                .blob
                .store(&output)
                .map_err(|e| BackendError::External(e.to_string()))?;
            deps.registry.transition(
                job_id,
                JobStatus::Running,
                JobStatus::Succeeded,
                TransitionMetadata::succeeded(handle.as_str()),
            )?;
            tracked.lock().await.remove(job_id);
        }
        BatchStatus::Failed { message, transient } => {
            let job = deps.registry.get(job_id)?;
            tracked.lock().await.remove(job_id);
            if transient && job.retries_remaining() > 0 {
                deps.registry.transition(
                    job_id,
                    JobStatus::Running,
                    JobStatus::Queued,
                    TransitionMetadata::retry(&message),
                )?;
                resubmit.lock().await.push(job_id.clone());
            } else {
                settle_failure(deps, &job, &message, transient, FailureKind::ExecutionError)
                    .await;
            }
        }
        BatchStatus::Unknown => {
            tracked.lock().await.remove(job_id);
            deps.registry.transition(
                job_id,
                JobStatus::Running,
                JobStatus::Failed,
                TransitionMetadata::failed(JobFailure::new(
                    FailureKind::ExecutionError,
                    "scheduler lost track of the submission",
                )),
            )?;
        }
    }
    Ok(())
}

/// Retries through the registry when budget remains, otherwise fails the job.
async fn settle_failure(
    deps: &ExecDeps,
    job: &Job,
    message: &str,
    transient: bool,
    kind: FailureKind,
) {
    let result = if transient && job.retries_remaining() > 0 {
        deps.registry
            .transition(
                &job.id,
                JobStatus::Running,
                JobStatus::Queued,
                TransitionMetadata::retry(message),
            )
            .map(|_| ())
    } else {
        deps.registry
            .transition(
                &job.id,
                JobStatus::Running,
                JobStatus::Failed,
                TransitionMetadata::failed(JobFailure::new(kind, message)),
            )
            .map(|_| ())
    };
    if let Err(err) = result {
        tracing::error!(job_id = %job.id, error = %err, "failed to settle job");
    }
}

#[async_trait]
impl ExecutionBackend for BatchBackend {
    async fn enqueue(&self, job: &Job) -> Result<(), BackendError> {
        let dispatched = dispatch(&self.deps, self.scheduler.as_ref(), &self.tracked, &job.id);
        dispatched.await?;
        // Submission failures with retry budget left go through the
        // monitor's resubmission list.
        if self.deps.registry.get(&job.id)?.status == JobStatus::Queued {
            self.resubmit.lock().await.push(job.id.clone());
        }
        Ok(())
    }

    async fn cancel(&self, job_id: &JobId) {
        self.deps.cancels.request(job_id);
    }

    async fn reattach(&self, job: &Job) {
        let Some(external_ref) = job.external_ref.clone() else {
            return;
        };
        // Remaining budget counts from the recorded start, not from now;
        // a job past its deadline times out on the next poll.
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let elapsed_ns = now_ns.saturating_sub(job.started_at_ns.unwrap_or(now_ns));
        let remaining = job.timeout().saturating_sub(Duration::from_nanos(elapsed_ns));
        self.tracked.lock().await.insert(
            job.id.clone(),
            Tracked {
                external_ref,
                deadline: Instant::now() + remaining,
            },
        );
    }

    async fn confirm_running(&self, job: &Job) -> bool {
        let Some(external_ref) = job.external_ref.as_deref() else {
            return false;
        };
        matches!(
            self.scheduler.status(external_ref).await,
            Ok(BatchStatus::Pending | BatchStatus::Running)
        )
    }

    async fn shutdown(&self) {
        // External work keeps running; startup recovery reconciles it
        // through `confirm_running` on the next boot.
        let _ = self.shutdown_tx.send(true);
        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// In-process scheduler stub driving the compute collaborator.
///
/// Stands in for a real cluster scheduler in tests and single-node
/// deployments; each submission runs as a detached task.
pub struct MemoryScheduler {
    compute: Arc<dyn ComputeCollaborator>,
    entries: Arc<Mutex<HashMap<String, BatchStatus>>>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MemoryScheduler {
    /// Creates a scheduler running submissions against the collaborator.
    #[must_use]
    pub fn new(compute: Arc<dyn ComputeCollaborator>) -> Self {
        Self {
            compute,
            entries: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BatchScheduler for MemoryScheduler {
    async fn submit(&self, job: &Job) -> Result<String, BackendError> {
        let external_ref = format!("batch-{}", uuid::Uuid::new_v4());
        self.entries
            .lock()
            .unwrap()
            .insert(external_ref.clone(), BatchStatus::Pending);

        let compute = Arc::clone(&self.compute);
        let entries = Arc::clone(&self.entries);
        let payload = job.spec.payload.clone();
        let entry_ref = external_ref.clone();
        let handle = tokio::spawn(async move {
            entries
                .lock()
                .unwrap()
                .insert(entry_ref.clone(), BatchStatus::Running);
            let status = match compute.execute(&payload).await {
                Ok(result) => BatchStatus::Succeeded {
                    output: result.bytes,
                },
                Err(err) => BatchStatus::Failed {
                    message: err.to_string(),
                    transient: err.is_transient(),
                },
            };
            entries.lock().unwrap().insert(entry_ref, status);
        });
        self.handles
            .lock()
            .unwrap()
            .insert(external_ref.clone(), handle);
        Ok(external_ref)
    }

    async fn status(&self, external_ref: &str) -> Result<BatchStatus, BackendError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(external_ref)
            .cloned()
            .unwrap_or(BatchStatus::Unknown))
    }

    async fn cancel(&self, external_ref: &str) {
        if let Some(handle) = self.handles.lock().unwrap().remove(external_ref) {
            handle.abort();
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(BatchStatus::Pending | BatchStatus::Running) = entries.get(external_ref) {
            entries.insert(
                external_ref.to_string(),
                BatchStatus::Failed {
                    message: "cancelled".to_string(),
                    transient: false,
                },
            );
        }
    }
}
