//! Caller identity value object.
//!
//! Authentication happens upstream; jobgate only receives an
//! already-validated identity and threads it through job submissions,
//! confirmation requests, and audit records for traceability.

use serde::{Deserialize, Serialize};

/// An authenticated caller identity supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (user id, service account, ...).
    pub subject: String,

    /// Role set attached to the subject.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    /// Creates an identity with the given subject and roles.
    #[must_use]
    pub fn new(subject: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            roles,
        }
    }

    /// Identity used for actions the system takes on its own behalf
    /// (orphan recovery, retention sweeps).
    #[must_use]
    pub fn system() -> Self {
        Self {
            subject: "system".to_string(),
            roles: vec!["system".to_string()],
        }
    }
}
