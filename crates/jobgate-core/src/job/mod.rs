//! Job entity and lifecycle state machine.
//!
//! A [`Job`] is the durable record of one requested unit of work. Its
//! status moves through a finite state machine:
//!
//! ```text
//! Queued --> Running --> { Succeeded | Failed | TimedOut | Cancelled }
//!   |           |
//!   |           +--> Queued   (internal retry only, attempt incremented)
//!   +--> Cancelled
//! ```
//!
//! No other backward transition is legal. Cancellation of a job already in
//! a terminal state is a no-op that reports the existing terminal state.
//!
//! The registry is the single source of truth for job state; this module
//! only defines the entity, the legal-edge table, and the typed failure
//! carried by jobs that end `Failed`.

mod error;
mod state;

#[cfg(test)]
mod tests;

pub use error::{FailureKind, JobFailure};
pub use state::{JobKind, JobStatus};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{self, Hash};
use crate::identity::Identity;

/// Unique identifier for a job.
///
/// Caller-supplied ids are accepted as-is; [`JobId::generate`] produces a
/// system-generated UUID when the caller doesn't provide one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh system id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps a caller-supplied id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What the caller asked to run.
///
/// The payload is opaque to jobgate: it is routed to the compute
/// collaborator unchanged and only ever digested for idempotency
/// comparison and audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Action name, used by the confirmation gate for classification.
    pub action: String,

    /// Opaque request payload forwarded to the compute collaborator.
    pub payload: serde_json::Value,

    /// Job kind.
    #[serde(default)]
    pub kind: JobKind,

    /// Per-job timeout in seconds, enforced by the execution backend
    /// independently of the collaborator's own behavior.
    pub timeout_secs: u64,

    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
}

impl JobSpec {
    /// Computes the canonical digest of this spec.
    ///
    /// Two submissions are "identical" for idempotency purposes exactly
    /// when their spec digests match.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn digest(&self) -> Result<Hash, serde_json::Error> {
        crypto::digest_json(self)
    }
}

/// Durable record of one requested unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: JobId,

    /// Job kind.
    pub kind: JobKind,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// The submitted spec.
    pub spec: JobSpec,

    /// Digest of the canonical spec encoding, used for idempotency
    /// conflict detection.
    pub spec_digest: Hash,

    /// Submission timestamp, nanoseconds since the Unix epoch.
    pub submitted_at_ns: u64,

    /// Timestamp of the most recent `Queued -> Running` transition.
    pub started_at_ns: Option<u64>,

    /// Timestamp of the terminal transition.
    pub completed_at_ns: Option<u64>,

    /// Execution attempt counter. 1 on first execution; incremented on
    /// each retry, never exceeding `max_retries + 1`.
    pub attempt: u32,

    /// Idempotency key, when the caller supplied one.
    pub idempotency_key: Option<String>,

    /// External scheduler reference, set by the batch backend.
    pub external_ref: Option<String>,

    /// Claim-check handle to the result payload, set only on success.
    pub result_handle: Option<String>,

    /// Typed failure, set only when the job ends `Failed`.
    pub failure: Option<JobFailure>,

    /// Correlation id threading this job through the audit log.
    pub correlation_id: String,

    /// Identity of the submitting caller.
    pub identity: Identity,
}

impl Job {
    /// Whether the job has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Remaining retry budget.
    #[must_use]
    pub fn retries_remaining(&self) -> u32 {
        self.spec
            .max_retries
            .saturating_add(1)
            .saturating_sub(self.attempt)
    }

    /// The per-job timeout as a [`std::time::Duration`].
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.spec.timeout_secs)
    }
}
