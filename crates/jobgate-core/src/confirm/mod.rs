//! Confirmation gate: critical actions wait for explicit human approval.
//!
//! The gate classifies every incoming action as routine or critical from a
//! static map. Routine actions flow straight into the registry; critical
//! actions park as a durable [`ConfirmationRequest`] and the caller gets
//! the request id back instead of a job. Approval and denial arrive as
//! separate [`ConfirmationGate::resolve`] calls.
//!
//! The pause is persisted state, not an in-memory suspension: pending
//! requests live in the registry database and survive process restart.
//!
//! # Idempotent resolution
//!
//! An approved request produces exactly one job whose id is derived from
//! the request id, so a client retrying the resolve call gets the same job
//! back. Resolving an already-resolved request returns the recorded
//! outcome. A denied request never produces a job.

mod gate;


pub use gate::{
    ActionClass, ConfirmError, ConfirmationGate, ConfirmationRequest, ConfirmationStatus,
    Decision, ProposalOutcome, ResolutionOutcome,
};
