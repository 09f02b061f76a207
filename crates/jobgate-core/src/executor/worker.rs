//! Shared per-attempt execution logic.
//!
//! The pool and queue variants both drain job ids from somewhere and then
//! do the same thing with each: claim it, call the collaborator under the
//! job's timeout, and write the outcome back through the registry's
//! transition contract. That common path lives here.

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::compute::ComputeCollaborator;
use crate::job::{Job, JobFailure, JobId, JobStatus};
use crate::registry::{JobRegistry, RegistryError, TransitionMetadata};

use super::{BackendError, BackoffPolicy, CancelRegistry};

/// Dependencies shared by every backend variant.
#[derive(Clone)]
pub struct ExecDeps {
    /// The job registry (single source of truth for job state).
    pub registry: Arc<JobRegistry>,

    /// The compute collaborator.
    pub compute: Arc<dyn ComputeCollaborator>,

    /// The claim-check store for result payloads.
    pub blob: Arc<dyn BlobStore>,

    /// Cooperative cancellation flags.
    pub cancels: CancelRegistry,

    /// Delay policy between retry attempts.
    pub backoff: BackoffPolicy,
}

/// What one execution attempt did with a job.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The job reached a terminal state.
    Settled,

    /// A transient failure re-queued the job; the caller must re-enqueue
    /// it with its delivery mechanism.
    Requeued(Job),

    /// The claim was lost (already claimed elsewhere, or cancelled while
    /// queued); the collaborator was never invoked.
    Skipped,
}

/// Runs one execution attempt for a queued job.
///
/// Claims the job (losing the claim means skipping — a cancelled queued
/// job is never executed), calls the collaborator under the job's
/// timeout, and settles the outcome through the registry.
///
/// # Errors
///
/// Returns an error only for registry/storage failures; collaborator
/// failures are absorbed into job state.
pub async fn run_attempt(deps: &ExecDeps, job_id: &JobId) -> Result<AttemptOutcome, BackendError> {
    let job = match deps.registry.claim_for_run(job_id, TransitionMetadata::start())? {
        Some(job) => job,
        None => return Ok(AttemptOutcome::Skipped),
    };

    // Checkpoint: cancellation requested between enqueue and claim.
    if deps.cancels.is_requested(job_id) {
        deps.registry.transition(
            job_id,
            JobStatus::Running,
            JobStatus::Cancelled,
            TransitionMetadata::cancelled("cancel observed before execution"),
        )?;
        deps.cancels.clear(job_id);
        return Ok(AttemptOutcome::Settled);
    }

    let call = deps.compute.execute(&job.spec.payload);
    let outcome = tokio::time::timeout(job.timeout(), call).await;

    match outcome {
        Err(_elapsed) => {
            // The collaborator call is abandoned, not killed; the
            // underlying work may still run to completion on its own.
            tracing::warn!(job_id = %job_id, timeout_secs = job.spec.timeout_secs, "job timed out");
            deps.registry.transition(
                job_id,
                JobStatus::Running,
                JobStatus::TimedOut,
                TransitionMetadata::timed_out(),
            )?;
            deps.cancels.clear(job_id);
            Ok(AttemptOutcome::Settled)
        }
        Ok(Ok(payload)) => {
            // A cancel requested mid-run loses to a completed
            // collaborator call: the job reports Succeeded.
            let handle = deps
                .blob
                .store(&payload.bytes)
                .map_err(|e| BackendError::External(e.to_string()))?;
            deps.registry.transition(
                job_id,
                JobStatus::Running,
                JobStatus::Succeeded,
                TransitionMetadata::succeeded(handle.as_str()),
            )?;
            deps.cancels.clear(job_id);
            Ok(AttemptOutcome::Settled)
        }
        Ok(Err(err)) => {
            if err.is_transient() && job.retries_remaining() > 0 {
                tracing::debug!(
                    job_id = %job_id,
                    attempt = job.attempt,
                    error = %err,
                    "transient failure, backing off before retry"
                );
                tokio::time::sleep(deps.backoff.delay_for(job.attempt + 1)).await;

                // Checkpoint: don't requeue a job cancelled during backoff.
                if deps.cancels.is_requested(job_id) {
                    deps.registry.transition(
                        job_id,
                        JobStatus::Running,
                        JobStatus::Cancelled,
                        TransitionMetadata::cancelled("cancel observed during retry backoff"),
                    )?;
                    deps.cancels.clear(job_id);
                    return Ok(AttemptOutcome::Settled);
                }

                match deps.registry.transition(
                    job_id,
                    JobStatus::Running,
                    JobStatus::Queued,
                    TransitionMetadata::retry(err.to_string()),
                ) {
                    Ok(requeued) => return Ok(AttemptOutcome::Requeued(requeued)),
                    Err(RegistryError::RetryBudgetExhausted { .. }) => {
                        // Budget raced away; fall through to terminal failure.
                    }
                    Err(other) => return Err(other.into()),
                }
            }

            deps.registry.transition(
                job_id,
                JobStatus::Running,
                JobStatus::Failed,
                TransitionMetadata::failed(JobFailure::new(err.failure_kind(), err.to_string())),
            )?;
            deps.cancels.clear(job_id);
            Ok(AttemptOutcome::Settled)
        }
    }
}
