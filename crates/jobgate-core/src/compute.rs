//! Compute collaborator interface.
//!
//! The collaborator performs one unit of domain work given an opaque
//! payload. jobgate never interprets payload semantics; it only routes,
//! times, and retries based on the returned error kind. Implementations
//! may be slow and may be faulty; the execution backend enforces the
//! per-job timeout independently of anything the collaborator does.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::FailureKind;

/// Error returned by a compute collaborator.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ComputeError {
    /// The payload was rejected before any work started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The execution environment is unavailable; worth retrying.
    #[error("environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    /// Work started but failed; worth retrying.
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// The collaborator's own deadline fired; worth retrying.
    #[error("collaborator timeout: {0}")]
    Timeout(String),
}

impl ComputeError {
    /// Whether the execution backend should retry this error, budget
    /// permitting.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.failure_kind().is_transient()
    }

    /// Maps the collaborator error onto the terminal failure taxonomy.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidInput(_) => FailureKind::InvalidInput,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::EnvironmentUnavailable(_) => FailureKind::EnvironmentUnavailable,
            Self::ExecutionError(_) => FailureKind::ExecutionError,
            Self::Timeout(_) => FailureKind::Timeout,
        }
    }
}

/// Result payload returned by a successful collaborator call.
///
/// Large payloads are expected; the execution backend immediately exchanges
/// the bytes for a claim-check handle through the blob store and only the
/// handle reaches the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPayload {
    /// Raw result bytes.
    pub bytes: Vec<u8>,

    /// MIME type of the result.
    pub content_type: String,
}

impl ResultPayload {
    /// Creates a JSON result payload.
    #[must_use]
    pub fn json(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "application/json".to_string(),
        }
    }
}

/// A synchronous-in-spirit callable that performs one unit of domain work.
///
/// The trait is async so implementations can bridge to external processes,
/// but the contract is a single request/response exchange: one payload in,
/// one result or one typed error out.
#[async_trait]
pub trait ComputeCollaborator: Send + Sync {
    /// Executes one unit of work.
    async fn execute(&self, payload: &serde_json::Value) -> Result<ResultPayload, ComputeError>;
}

/// One scripted outcome for the [`StubCollaborator`].
#[derive(Debug, Clone)]
pub enum StubOutcome {
    /// Succeed with the given result bytes.
    Succeed(Vec<u8>),

    /// Fail with the given error.
    Fail(ComputeError),

    /// Sleep for the given duration, then succeed. Used to exercise the
    /// backend-enforced timeout.
    Hang(Duration),
}

/// In-memory collaborator that replays a scripted sequence of outcomes.
///
/// Each call consumes the next outcome in the script; once the script is
/// exhausted every further call succeeds with an empty result. Used by
/// tests and as the fast stub implementation.
pub struct StubCollaborator {
    script: Mutex<VecDeque<StubOutcome>>,
    calls: Mutex<u32>,
}

impl StubCollaborator {
    /// Creates a stub that always succeeds with an empty result.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::scripted(vec![])
    }

    /// Creates a stub that replays the given outcomes in order.
    #[must_use]
    pub fn scripted(outcomes: Vec<StubOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            calls: Mutex::new(0),
        }
    }

    /// Number of times `execute` has been called.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ComputeCollaborator for StubCollaborator {
    async fn execute(&self, _payload: &serde_json::Value) -> Result<ResultPayload, ComputeError> {
        *self.calls.lock().unwrap() += 1;
        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            None => Ok(ResultPayload::json(b"{}".to_vec())),
            Some(StubOutcome::Succeed(bytes)) => Ok(ResultPayload::json(bytes)),
            Some(StubOutcome::Fail(err)) => Err(err),
            Some(StubOutcome::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(ResultPayload::json(b"{}".to_vec()))
            }
        }
    }
}
