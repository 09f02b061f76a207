//! Tamper-evident audit log.
//!
//! Append-only, hash-chained event store backed by `SQLite` with WAL mode.
//! Every component of the core emits events into it: submissions, state
//! transitions, confirmation proposals and resolutions, retention purges.
//!
//! # Tamper evidence
//!
//! Each event's hash covers its canonical encoding plus the previous
//! event's hash. [`AuditLog::verify`] replays a range, recomputing hashes
//! from the first event and the last known-good previous hash, and names
//! the first divergent event if any stored hash does not match. Any
//! retroactive edit to an earlier event therefore invalidates every hash
//! computed after it.
//!
//! # Ordering
//!
//! One log database is one partition: the connection lock serializes
//! appends, so events are strictly ordered and the chain never forks.

mod storage;

#[cfg(test)]
mod tests;

pub use storage::{AuditError, AuditEvent, AuditLog, AuditStats};

/// Event type emitted when a job is accepted into the registry.
pub const JOB_SUBMITTED: &str = "job.submitted";

/// Event type emitted on every job state transition, one per transition.
pub const JOB_TRANSITIONED: &str = "job.transitioned";

/// Event type emitted when the batch backend hands a job to the external
/// scheduler. The span from `job.submitted` to this event is queue-wait
/// latency; from this event to the terminal transition is compute latency.
pub const JOB_DISPATCHED: &str = "job.dispatched";

/// Event type emitted when a critical action is proposed.
pub const CONFIRMATION_PROPOSED: &str = "confirmation.proposed";

/// Event type emitted when a confirmation request is approved.
pub const CONFIRMATION_APPROVED: &str = "confirmation.approved";

/// Event type emitted when a confirmation request is denied.
pub const CONFIRMATION_DENIED: &str = "confirmation.denied";

/// Event type emitted when the retention manager purges a job record.
pub const JOB_PURGED: &str = "job.purged";

/// Event type emitted when startup recovery fails an orphaned job.
pub const JOB_ORPHANED: &str = "job.orphaned";
