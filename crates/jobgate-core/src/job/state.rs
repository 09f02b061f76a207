//! Job status and kind enums with the legal-edge table.

use serde::{Deserialize, Serialize};

/// The kind of work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// One self-contained unit of work.
    #[default]
    SingleRun,

    /// A batch of related work submitted as one job.
    BatchRun,

    /// Anything else; treated like `SingleRun` by the core.
    Other,
}

impl JobKind {
    /// String form used in storage and audit payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleRun => "single_run",
            Self::BatchRun => "batch_run",
            Self::Other => "other",
        }
    }

    /// Parses the storage string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single_run" => Some(Self::SingleRun),
            "batch_run" => Some(Self::BatchRun),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and waiting for an execution backend to pick it up.
    Queued,

    /// An execution backend is driving it.
    Running,

    /// Terminal: the collaborator returned a result.
    Succeeded,

    /// Terminal: the collaborator failed permanently or retries ran out.
    Failed,

    /// Terminal: the per-job timeout elapsed before the collaborator
    /// returned.
    TimedOut,

    /// Terminal: cancelled before or during execution.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether the edge `self -> to` is in the legal-edge table.
    ///
    /// `Running -> Queued` is the internal retry edge; the registry
    /// additionally requires the attempt counter to stay within the retry
    /// budget when taking it.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Succeeded
                        | Self::Failed
                        | Self::TimedOut
                        | Self::Cancelled
                        | Self::Queued
                )
        )
    }

    /// String form used in storage and audit payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the storage string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
