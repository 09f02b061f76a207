//! Confirm-before-execute job orchestration core.
//!
//! `jobgate-core` tracks long-running compute jobs through a durable
//! registry and state machine, holds designated critical actions behind a
//! human confirmation gate, executes work through one of three pluggable
//! backends, and records every decision in a hash-chained tamper-evident
//! audit log.
//!
//! # Architecture
//!
//! - [`registry`]: `SQLite`-backed job registry; every state change is a
//!   guarded compare-and-swap keyed on the expected current status.
//! - [`confirm`]: classifies actions as routine or critical and parks
//!   critical ones as durable pending confirmations until a human
//!   approves or denies them.
//! - [`executor`]: the execution backends (in-process pool, broker
//!   queue, external batch scheduler) behind one trait.
//! - [`audit`]: append-only event log where each event's hash covers the
//!   previous event's hash, so any rewrite breaks verification.
//! - [`retention`]: purges terminal jobs past the retention window and
//!   reclaims their result payloads.
//! - [`orchestrator`]: the facade tying the above together, including
//!   startup recovery of jobs stranded by a crash.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use jobgate_core::blob::MemoryBlobStore;
//! use jobgate_core::compute::StubCollaborator;
//! use jobgate_core::config::JobgateConfig;
//! use jobgate_core::identity::Identity;
//! use jobgate_core::job::{JobKind, JobSpec};
//! use jobgate_core::orchestrator::Orchestrator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = JobgateConfig::default();
//! let orchestrator = Orchestrator::start(
//!     &config,
//!     Arc::new(StubCollaborator::succeeding()),
//!     Arc::new(MemoryBlobStore::new()),
//!     None,
//! )
//! .await?;
//!
//! let outcome = orchestrator
//!     .submit(
//!         JobSpec {
//!             action: "run_simulation".to_string(),
//!             payload: serde_json::json!({"seed": 42}),
//!             kind: JobKind::SingleRun,
//!             timeout_secs: 300,
//!             max_retries: 2,
//!         },
//!         Identity::new("alice", vec!["scientist".to_string()]),
//!         None,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod blob;
pub mod compute;
pub mod config;
pub mod confirm;
pub mod crypto;
pub mod executor;
pub mod identity;
pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod retention;

pub use identity::Identity;
pub use job::{Job, JobId, JobKind, JobSpec, JobStatus};
pub use orchestrator::{Orchestrator, OrchestratorError};
