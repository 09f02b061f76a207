//! Tests for the job entity and state machine.

use super::*;

fn spec(action: &str) -> JobSpec {
    JobSpec {
        action: action.to_string(),
        payload: serde_json::json!({"input": 42}),
        kind: JobKind::SingleRun,
        timeout_secs: 30,
        max_retries: 2,
    }
}

// =============================================================================
// Legal-edge table
// =============================================================================

#[test]
fn test_queued_edges() {
    assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
    assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
    assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
    assert!(!JobStatus::Queued.can_transition_to(JobStatus::Failed));
    assert!(!JobStatus::Queued.can_transition_to(JobStatus::TimedOut));
    assert!(!JobStatus::Queued.can_transition_to(JobStatus::Queued));
}

#[test]
fn test_running_edges() {
    assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
    assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
    assert!(JobStatus::Running.can_transition_to(JobStatus::TimedOut));
    assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
    // Retry edge.
    assert!(JobStatus::Running.can_transition_to(JobStatus::Queued));
    assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
}

#[test]
fn test_terminal_states_have_no_edges() {
    for terminal in [
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::TimedOut,
        JobStatus::Cancelled,
    ] {
        assert!(terminal.is_terminal());
        for to in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Cancelled,
        ] {
            assert!(
                !terminal.can_transition_to(to),
                "{terminal} -> {to} must be illegal"
            );
        }
    }
}

#[test]
fn test_active_states_are_not_terminal() {
    assert!(!JobStatus::Queued.is_terminal());
    assert!(!JobStatus::Running.is_terminal());
}

#[test]
fn test_status_round_trips_through_storage_form() {
    for status in [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::TimedOut,
        JobStatus::Cancelled,
    ] {
        assert_eq!(JobStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(JobStatus::parse("bogus"), None);
}

#[test]
fn test_kind_round_trips_through_storage_form() {
    for kind in [JobKind::SingleRun, JobKind::BatchRun, JobKind::Other] {
        assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(JobKind::parse(""), None);
}

// =============================================================================
// Spec digest
// =============================================================================

#[test]
fn test_spec_digest_is_stable() {
    let a = spec("simulate");
    let b = spec("simulate");
    assert_eq!(a.digest().unwrap(), b.digest().unwrap());
}

#[test]
fn test_spec_digest_differs_on_payload_change() {
    let a = spec("simulate");
    let mut b = spec("simulate");
    b.payload = serde_json::json!({"input": 43});
    assert_ne!(a.digest().unwrap(), b.digest().unwrap());
}

// =============================================================================
// Failure classification
// =============================================================================

#[test]
fn test_transient_failure_kinds() {
    assert!(FailureKind::EnvironmentUnavailable.is_transient());
    assert!(FailureKind::ExecutionError.is_transient());
    assert!(FailureKind::Timeout.is_transient());
    assert!(!FailureKind::InvalidInput.is_transient());
    assert!(!FailureKind::NotFound.is_transient());
    assert!(!FailureKind::Orphaned.is_transient());
}

#[test]
fn test_job_id_generate_is_unique() {
    assert_ne!(JobId::generate(), JobId::generate());
}

#[test]
fn test_retries_remaining() {
    let s = spec("simulate");
    let digest = s.digest().unwrap();
    let job = Job {
        id: JobId::generate(),
        kind: JobKind::SingleRun,
        status: JobStatus::Queued,
        spec: s,
        spec_digest: digest,
        submitted_at_ns: 0,
        started_at_ns: None,
        completed_at_ns: None,
        attempt: 1,
        idempotency_key: None,
        external_ref: None,
        result_handle: None,
        failure: None,
        correlation_id: "corr-1".to_string(),
        identity: crate::identity::Identity::new("alice", vec![]),
    };
    // max_retries = 2 allows attempts 1, 2, 3.
    assert_eq!(job.retries_remaining(), 2);

    let mut unbounded = job;
    unbounded.spec.max_retries = u32::MAX;
    assert_eq!(unbounded.retries_remaining(), u32::MAX - 1);
    unbounded.attempt = u32::MAX;
    assert_eq!(unbounded.retries_remaining(), 0);
}
