//! End-to-end tests through the orchestrator facade.

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::audit;
use crate::blob::MemoryBlobStore;
use crate::compute::{ComputeError, StubCollaborator, StubOutcome};
use crate::config::RetentionConfig;
use crate::executor::{BackendConfig, BackoffPolicy, Backpressure};
use crate::job::{FailureKind, JobKind};
use crate::registry::SubmitRequest;

fn config_in(dir: &tempfile::TempDir, critical: &[&str], window: Duration) -> JobgateConfig {
    JobgateConfig {
        registry_path: dir.path().join("registry.db"),
        audit_path: dir.path().join("audit.db"),
        backend: BackendConfig::Pool {
            workers: 1,
            queue_depth: 16,
            backpressure: Backpressure::Block,
        },
        backoff: BackoffPolicy::Fixed {
            delay: Duration::from_millis(1),
        },
        critical_actions: critical.iter().map(ToString::to_string).collect(),
        retention: RetentionConfig {
            window,
            sweep_interval: Duration::from_secs(3600),
        },
    }
}

async fn start_with(
    config: &JobgateConfig,
    stub: Arc<StubCollaborator>,
) -> Orchestrator {
    Orchestrator::start(config, stub, Arc::new(MemoryBlobStore::new()), None)
        .await
        .unwrap()
}

fn spec(action: &str) -> JobSpec {
    JobSpec {
        action: action.to_string(),
        payload: serde_json::json!({"seed": 7}),
        kind: JobKind::SingleRun,
        timeout_secs: 30,
        max_retries: 0,
    }
}

fn alice() -> Identity {
    Identity::new("alice", vec!["scientist".to_string()])
}

fn bob() -> Identity {
    Identity::new("bob", vec!["approver".to_string()])
}

async fn wait_terminal(orchestrator: &Orchestrator, job_id: &JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let job = orchestrator.get(job_id).unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_routine_submission_runs_to_success() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));
    let stub = Arc::new(StubCollaborator::scripted(vec![StubOutcome::Succeed(
        b"[1, 2, 3]".to_vec(),
    )]));
    let orchestrator = start_with(&config, stub).await;

    let outcome = orchestrator
        .submit(spec("run_simulation"), alice(), None)
        .await
        .unwrap();
    let ProposalOutcome::Submitted(job) = outcome else {
        panic!("expected immediate submission");
    };

    let settled = wait_terminal(&orchestrator, &job.id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(
        orchestrator.fetch_result(&job.id).unwrap(),
        Some(b"[1, 2, 3]".to_vec())
    );
    orchestrator.audit_log().verify_all().unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_critical_action_held_until_approved() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &["delete_dataset"], Duration::from_secs(86400));
    let stub = Arc::new(StubCollaborator::succeeding());
    let orchestrator = start_with(&config, Arc::clone(&stub)).await;

    let ProposalOutcome::PendingApproval { request_id } = orchestrator
        .submit(spec("delete_dataset"), alice(), None)
        .await
        .unwrap()
    else {
        panic!("expected pending approval");
    };
    assert_eq!(orchestrator.pending_confirmations().unwrap().len(), 1);
    assert_eq!(stub.call_count(), 0);

    let ResolutionOutcome::Approved(job) = orchestrator
        .resolve_confirmation(&request_id, Decision::Approve, &bob())
        .await
        .unwrap()
    else {
        panic!("expected approval");
    };

    let settled = wait_terminal(&orchestrator, &job.id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(stub.call_count(), 1);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_denied_action_never_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &["delete_dataset"], Duration::from_secs(86400));
    let stub = Arc::new(StubCollaborator::succeeding());
    let orchestrator = start_with(&config, Arc::clone(&stub)).await;

    let ProposalOutcome::PendingApproval { request_id } = orchestrator
        .submit(spec("delete_dataset"), alice(), None)
        .await
        .unwrap()
    else {
        panic!("expected pending approval");
    };
    assert!(matches!(
        orchestrator
            .resolve_confirmation(&request_id, Decision::Deny, &bob())
            .await
            .unwrap(),
        ResolutionOutcome::Denied
    ));

    assert_eq!(orchestrator.stats().unwrap().queued, 0);
    assert_eq!(stub.call_count(), 0);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_job_before_execution() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));
    let stub = Arc::new(StubCollaborator::scripted(vec![StubOutcome::Hang(
        Duration::from_secs(5),
    )]));
    let orchestrator = start_with(&config, Arc::clone(&stub)).await;

    // The single worker is busy with the hanging job, so the second
    // submission stays queued long enough to cancel.
    let ProposalOutcome::Submitted(blocker) = orchestrator
        .submit(
            JobSpec {
                timeout_secs: 60,
                ..spec("run_simulation")
            },
            alice(),
            None,
        )
        .await
        .unwrap()
    else {
        panic!("expected immediate submission");
    };
    let ProposalOutcome::Submitted(victim) = orchestrator
        .submit(spec("run_simulation"), alice(), None)
        .await
        .unwrap()
    else {
        panic!("expected immediate submission");
    };

    let cancelled = orchestrator.cancel(&victim.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let blocker_settled = wait_terminal(&orchestrator, &blocker.id).await;
    assert_eq!(blocker_settled.status, JobStatus::Succeeded);
    // The victim's payload was never executed.
    assert_eq!(stub.call_count(), 1);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_flag_does_not_outlive_a_completed_job() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));
    let stub = Arc::new(StubCollaborator::scripted(vec![StubOutcome::Hang(
        Duration::from_secs(1),
    )]));
    let orchestrator = start_with(&config, Arc::clone(&stub)).await;

    let ProposalOutcome::Submitted(job) = orchestrator
        .submit(
            JobSpec {
                timeout_secs: 60,
                ..spec("run_simulation")
            },
            alice(),
            None,
        )
        .await
        .unwrap()
    else {
        panic!("expected immediate submission");
    };

    // Wait for the worker to claim the job, then cancel mid-run.
    tokio::time::timeout(Duration::from_secs(60), async {
        while orchestrator.get(&job.id).unwrap().status != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    orchestrator.cancel(&job.id).await.unwrap();

    // The collaborator completes anyway; the flag must not linger once
    // the job settles.
    let settled = wait_terminal(&orchestrator, &job.id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert!(!orchestrator.cancels.is_requested(&job.id));
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_terminal_job_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));
    let orchestrator = start_with(&config, Arc::new(StubCollaborator::succeeding())).await;

    let ProposalOutcome::Submitted(job) = orchestrator
        .submit(spec("run_simulation"), alice(), None)
        .await
        .unwrap()
    else {
        panic!("expected immediate submission");
    };
    let settled = wait_terminal(&orchestrator, &job.id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);

    let after_cancel = orchestrator.cancel(&job.id).await.unwrap();
    assert_eq!(after_cancel.status, JobStatus::Succeeded);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_fails_unconfirmable_running_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));

    // Previous process: a job was claimed and the process died.
    let job_id = {
        let audit = Arc::new(AuditLog::open(&config.audit_path).unwrap());
        let registry = Arc::new(JobRegistry::open(&config.registry_path, audit).unwrap());
        let job = registry
            .submit(SubmitRequest::new(spec("run_simulation"), alice()))
            .unwrap();
        registry
            .claim_for_run(&job.id, TransitionMetadata::start())
            .unwrap()
            .unwrap();
        job.id
    };

    let orchestrator = start_with(&config, Arc::new(StubCollaborator::succeeding())).await;
    let job = orchestrator.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure.unwrap().kind, FailureKind::Orphaned);

    let events = orchestrator
        .audit_log()
        .read_by_correlation(&job.correlation_id)
        .unwrap();
    assert_eq!(events.last().unwrap().event_type, audit::JOB_ORPHANED);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_reenqueues_queued_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));

    let job_id = {
        let audit = Arc::new(AuditLog::open(&config.audit_path).unwrap());
        let registry = Arc::new(JobRegistry::open(&config.registry_path, audit).unwrap());
        registry
            .submit(SubmitRequest::new(spec("run_simulation"), alice()))
            .unwrap()
            .id
    };

    let orchestrator = start_with(&config, Arc::new(StubCollaborator::succeeding())).await;
    let settled = wait_terminal(&orchestrator, &job_id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_retention_sweep_purges_and_audits() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::ZERO);
    let orchestrator = start_with(&config, Arc::new(StubCollaborator::succeeding())).await;

    let ProposalOutcome::Submitted(job) = orchestrator
        .submit(spec("run_simulation"), alice(), None)
        .await
        .unwrap()
    else {
        panic!("expected immediate submission");
    };

    // With a zero window the background sweeper may purge the job the
    // moment it settles, so the job disappearing counts as settled here.
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match orchestrator.get(&job.id) {
                Ok(current) if current.is_terminal() => return,
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(OrchestratorError::Registry(RegistryError::NotFound { .. })) => return,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    })
    .await
    .unwrap();

    orchestrator.sweep_retention().unwrap();
    assert!(matches!(
        orchestrator.get(&job.id),
        Err(OrchestratorError::Registry(RegistryError::NotFound { .. }))
    ));
    let events = orchestrator
        .audit_log()
        .read_by_correlation(&job.correlation_id)
        .unwrap();
    assert_eq!(events.last().unwrap().event_type, audit::JOB_PURGED);
    orchestrator.audit_log().verify_all().unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_submission_survives_backend_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));
    let orchestrator = start_with(&config, Arc::new(StubCollaborator::succeeding())).await;
    orchestrator.shutdown().await;

    // The job row is created before the enqueue fails, so it is durable
    // and picked up by the next process's recovery pass.
    let err = orchestrator
        .submit(spec("run_simulation"), alice(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Backend(BackendError::Closed)
    ));
    assert_eq!(orchestrator.stats().unwrap().queued, 1);
    let stranded = {
        let audit = Arc::new(AuditLog::open(&config.audit_path).unwrap());
        let registry = JobRegistry::open(&config.registry_path, audit).unwrap();
        registry.list_active().unwrap().remove(0)
    };
    drop(orchestrator);

    let orchestrator = start_with(&config, Arc::new(StubCollaborator::succeeding())).await;
    let settled = wait_terminal(&orchestrator, &stranded.id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_retries_through_facade() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir, &[], Duration::from_secs(86400));
    let stub = Arc::new(StubCollaborator::scripted(vec![
        StubOutcome::Fail(ComputeError::EnvironmentUnavailable("no gpus".to_string())),
        StubOutcome::Succeed(b"ok".to_vec()),
    ]));
    let orchestrator = start_with(&config, Arc::clone(&stub)).await;

    let ProposalOutcome::Submitted(job) = orchestrator
        .submit(
            JobSpec {
                max_retries: 1,
                ..spec("run_simulation")
            },
            alice(),
            None,
        )
        .await
        .unwrap()
    else {
        panic!("expected immediate submission");
    };

    let settled = wait_terminal(&orchestrator, &job.id).await;
    assert_eq!(settled.status, JobStatus::Succeeded);
    assert_eq!(settled.attempt, 2);
    assert_eq!(stub.call_count(), 2);
    orchestrator.shutdown().await;
}
