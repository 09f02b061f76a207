//! Durable job registry and state machine enforcement.
//!
//! The registry is the single source of truth for job state. It survives
//! process restart, serializes idempotency-key collisions so exactly one
//! job is created per key, and enforces the legal-edge table from
//! [`crate::job`] with per-row compare-and-swap semantics: concurrent
//! callers can race to transition the same job, exactly one wins, and the
//! losers observe the new state.
//!
//! Every submission and every won transition appends exactly one event to
//! the audit log.

mod storage;


pub use storage::{
    JobRegistry, RegistryError, RegistryStats, SubmitRequest, TransitionMetadata,
};
