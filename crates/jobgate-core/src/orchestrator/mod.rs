//! Top-level facade wiring the registry, confirmation gate, execution
//! backend, and retention sweep together.
//!
//! One orchestrator owns one registry/audit pair. Construction runs the
//! startup recovery pass: queued jobs are re-enqueued, running jobs that
//! the backend can still vouch for resume tracking, and the rest are
//! failed as orphaned.

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::{AuditError, AuditLog};
use crate::blob::{BlobError, BlobStore};
use crate::compute::ComputeCollaborator;
use crate::config::JobgateConfig;
use crate::confirm::{ConfirmError, ConfirmationGate, ConfirmationRequest, Decision, ProposalOutcome, ResolutionOutcome};
use crate::executor::{
    batch::BatchScheduler, build_backend, BackendError, CancelRegistry, ExecDeps, ExecutionBackend,
};
use crate::identity::Identity;
use crate::job::{Job, JobId, JobSpec, JobStatus};
use crate::registry::{JobRegistry, RegistryError, RegistryStats, TransitionMetadata};
use crate::retention::{RetentionError, RetentionManager, SweepReport};

/// Errors surfaced by the orchestrator facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Registry interaction failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Confirmation gate interaction failed.
    #[error("confirmation error: {0}")]
    Confirm(#[from] ConfirmError),

    /// Execution backend interaction failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Audit log interaction failed.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// Claim-check store interaction failed.
    #[error("blob error: {0}")]
    Blob(#[from] BlobError),

    /// Retention sweep failed.
    #[error("retention error: {0}")]
    Retention(#[from] RetentionError),
}

/// The assembled orchestration core.
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    gate: ConfirmationGate,
    backend: Arc<dyn ExecutionBackend>,
    blob: Arc<dyn BlobStore>,
    cancels: CancelRegistry,
    retention: Arc<RetentionManager>,
    shutdown_tx: watch::Sender<bool>,
    retention_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Opens the databases, builds the configured backend, spawns the
    /// retention sweep, and runs startup recovery.
    ///
    /// # Errors
    ///
    /// Returns an error when a database cannot be opened or recovery
    /// fails.
    pub async fn start(
        config: &JobgateConfig,
        compute: Arc<dyn ComputeCollaborator>,
        blob: Arc<dyn BlobStore>,
        scheduler: Option<Arc<dyn BatchScheduler>>,
    ) -> Result<Self, OrchestratorError> {
        let audit = Arc::new(AuditLog::open(&config.audit_path)?);
        let registry = Arc::new(JobRegistry::open(&config.registry_path, audit)?);

        let cancels = CancelRegistry::new();
        let deps = ExecDeps {
            registry: Arc::clone(&registry),
            compute,
            blob: Arc::clone(&blob),
            cancels: cancels.clone(),
            backoff: config.backoff.clone(),
        };
        let backend = build_backend(&config.backend, deps, scheduler);
        let gate = ConfirmationGate::new(Arc::clone(&registry), config.critical_actions.clone());

        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&registry),
            Arc::clone(&blob),
            config.retention.window,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let retention_task =
            Arc::clone(&retention).spawn(config.retention.sweep_interval, shutdown_rx);

        let orchestrator = Self {
            registry,
            gate,
            backend,
            blob,
            cancels,
            retention,
            shutdown_tx,
            retention_task: Mutex::new(Some(retention_task)),
        };
        orchestrator.recover().await?;
        Ok(orchestrator)
    }

    /// Reconciles jobs left active by the previous process.
    async fn recover(&self) -> Result<(), OrchestratorError> {
        let pending = self.gate.pending()?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "pending confirmations awaiting resolve");
        }

        for job in self.registry.list_active()? {
            match job.status {
                JobStatus::Queued => {
                    tracing::info!(job_id = %job.id, "re-enqueueing job found queued at startup");
                    self.backend.enqueue(&job).await?;
                }
                JobStatus::Running => {
                    if self.backend.confirm_running(&job).await {
                        tracing::info!(job_id = %job.id, "resuming confirmed-alive job");
                        self.backend.reattach(&job).await;
                    } else {
                        tracing::warn!(job_id = %job.id, "failing orphaned job");
                        self.registry.transition(
                            &job.id,
                            JobStatus::Running,
                            JobStatus::Failed,
                            TransitionMetadata::orphaned(),
                        )?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Proposes a job. Routine actions are submitted and enqueued
    /// immediately; critical actions park as a pending confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error when validation, storage, or enqueueing fails.
    pub async fn submit(
        &self,
        spec: JobSpec,
        identity: Identity,
        idempotency_key: Option<String>,
    ) -> Result<ProposalOutcome, OrchestratorError> {
        let outcome = self.gate.propose(spec, identity, idempotency_key)?;
        if let ProposalOutcome::Submitted(job) = &outcome {
            // An idempotent resubmission returns the original job, which
            // may already be past Queued.
            if job.status == JobStatus::Queued {
                self.backend.enqueue(job).await?;
            }
        }
        Ok(outcome)
    }

    /// Resolves a pending confirmation. Approval creates and enqueues the
    /// job; denial is final.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown request or a storage failure.
    pub async fn resolve_confirmation(
        &self,
        request_id: &str,
        decision: Decision,
        approver: &Identity,
    ) -> Result<ResolutionOutcome, OrchestratorError> {
        let outcome = self.gate.resolve(request_id, decision, approver)?;
        if let ResolutionOutcome::Approved(job) = &outcome {
            if job.status == JobStatus::Queued {
                self.backend.enqueue(job).await?;
            }
        }
        Ok(outcome)
    }

    /// Fetches the current state of a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown (or already purged) id.
    pub fn get(&self, job_id: &JobId) -> Result<Job, OrchestratorError> {
        Ok(self.registry.get(job_id)?)
    }

    /// Fetches a succeeded job's result payload from the claim-check
    /// store, or `None` when the job has no result handle.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job or a reclaimed payload.
    pub fn fetch_result(&self, job_id: &JobId) -> Result<Option<Vec<u8>>, OrchestratorError> {
        let job = self.registry.get(job_id)?;
        match job.result_handle {
            Some(handle) => Ok(Some(
                self.blob.fetch(&crate::blob::BlobHandle::new(handle))?,
            )),
            None => Ok(None),
        }
    }

    /// Requests cancellation. A queued job cancels atomically; a running
    /// job gets a cooperative flag and may still finish if its
    /// collaborator call completes first. Cancelling a terminal job is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn cancel(&self, job_id: &JobId) -> Result<Job, OrchestratorError> {
        let job = self.registry.get(job_id)?;
        match job.status {
            JobStatus::Queued => {
                match self.registry.transition(
                    job_id,
                    JobStatus::Queued,
                    JobStatus::Cancelled,
                    TransitionMetadata::cancelled("operator cancel"),
                ) {
                    Ok(cancelled) => Ok(cancelled),
                    Err(RegistryError::IllegalTransition { .. }) => {
                        // A worker claimed it first; downgrade to the
                        // cooperative path.
                        let current = self.registry.get(job_id)?;
                        if current.status == JobStatus::Running {
                            return self.cancel_running(job_id).await;
                        }
                        Ok(current)
                    }
                    Err(other) => Err(other.into()),
                }
            }
            JobStatus::Running => self.cancel_running(job_id).await,
            _ => Ok(job),
        }
    }

    /// Raises the cooperative flag for a running job, dropping it again
    /// if the job settled while the request was in flight.
    async fn cancel_running(&self, job_id: &JobId) -> Result<Job, OrchestratorError> {
        self.backend.cancel(job_id).await;
        let current = self.registry.get(job_id)?;
        if current.is_terminal() {
            // The collaborator finished first; the flag has no observer
            // left and would otherwise linger forever.
            self.cancels.clear(job_id);
        }
        Ok(current)
    }

    /// Confirmation requests still awaiting resolve.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_confirmations(&self) -> Result<Vec<ConfirmationRequest>, OrchestratorError> {
        Ok(self.gate.pending()?)
    }

    /// Registry counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn stats(&self) -> Result<RegistryStats, OrchestratorError> {
        Ok(self.registry.stats()?)
    }

    /// Runs one retention sweep immediately.
    ///
    /// # Errors
    ///
    /// Returns an error when the purge or an audit append fails.
    pub fn sweep_retention(&self) -> Result<SweepReport, OrchestratorError> {
        Ok(self.retention.run_once()?)
    }

    /// The underlying audit log, for reads and chain verification.
    #[must_use]
    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.registry.audit_log()
    }

    /// Stops the retention sweep and drains the execution backend.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let retention_task = self.retention_task.lock().unwrap().take();
        if let Some(handle) = retention_task {
            let _ = handle.await;
        }
        self.backend.shutdown().await;
    }
}
