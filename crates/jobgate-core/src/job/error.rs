//! Typed terminal failures carried by jobs that end `Failed`.

use serde::{Deserialize, Serialize};

/// Classification of a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The collaborator rejected the payload.
    InvalidInput,

    /// The collaborator couldn't find a referenced entity.
    NotFound,

    /// The collaborator's environment was unavailable (transient).
    EnvironmentUnavailable,

    /// The collaborator reported an execution error (transient).
    ExecutionError,

    /// The collaborator's own timeout fired (transient). Distinct from the
    /// backend-enforced per-job timeout, which terminates the job
    /// `TimedOut` rather than `Failed`.
    Timeout,

    /// The job was left `Running` by a prior process and no backend could
    /// confirm it alive at startup.
    Orphaned,
}

impl FailureKind {
    /// Whether failures of this kind are retried up to the job's retry
    /// budget. `InvalidInput` and `NotFound` never benefit from a retry;
    /// `Orphaned` is assigned by recovery, not by execution.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::EnvironmentUnavailable | Self::ExecutionError | Self::Timeout
        )
    }

    /// String form used in storage and audit payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::EnvironmentUnavailable => "environment_unavailable",
            Self::ExecutionError => "execution_error",
            Self::Timeout => "timeout",
            Self::Orphaned => "orphaned",
        }
    }
}

/// The typed failure stored on a job that ended `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failure classification.
    pub kind: FailureKind,

    /// Human-readable detail from the collaborator or from recovery.
    pub message: String,
}

impl JobFailure {
    /// Creates a failure record.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The distinguished failure assigned to jobs found `Running` at
    /// startup with no backend able to confirm them alive.
    #[must_use]
    pub fn orphaned() -> Self {
        Self {
            kind: FailureKind::Orphaned,
            message: "job was running when the process restarted and could not be confirmed alive"
                .to_string(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}
