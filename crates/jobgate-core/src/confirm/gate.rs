//! Confirmation gate implementation.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::audit::{self, AuditEvent, AuditError, AuditLog};
use crate::crypto::digest_hex;
use crate::identity::Identity;
use crate::job::{Job, JobId, JobSpec};
use crate::registry::{JobRegistry, RegistryError, SubmitRequest};

/// Classification of an action name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Executes immediately.
    Routine,

    /// Requires explicit human approval before a job is created.
    Critical,
}

/// Lifecycle status of a confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Waiting for a resolve call.
    Pending,

    /// Approved; a job was created.
    Approved,

    /// Denied; no job was or ever will be created.
    Denied,
}

impl ConfirmationStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

/// The resolve decision delivered by the approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Approve: create the job.
    Approve,

    /// Deny: discard the request.
    Deny,
}

/// A parked critical action awaiting approval.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    /// Unique request id.
    pub request_id: String,

    /// The spec that will become a job on approval.
    pub spec: JobSpec,

    /// Current status.
    pub status: ConfirmationStatus,

    /// Creation timestamp, nanoseconds since the Unix epoch.
    pub created_at_ns: u64,

    /// Resolution timestamp, set when the request leaves `Pending`.
    pub resolved_at_ns: Option<u64>,

    /// The job produced by approval, when approved.
    pub job_id: Option<JobId>,

    /// Idempotency key carried from the proposal to the approved job.
    pub idempotency_key: Option<String>,

    /// Correlation id shared with the eventual job.
    pub correlation_id: String,

    /// Identity of the proposing caller.
    pub identity: Identity,
}

/// Outcome of proposing an action through the gate.
#[derive(Debug)]
pub enum ProposalOutcome {
    /// The action was routine; a job was created immediately.
    Submitted(Job),

    /// The action is critical; approval is required before any job exists.
    PendingApproval {
        /// The confirmation request id to resolve later.
        request_id: String,
    },
}

/// Outcome of resolving a confirmation request.
#[derive(Debug)]
pub enum ResolutionOutcome {
    /// The request was approved and this job was created (or had already
    /// been created by an earlier resolve of the same request).
    Approved(Job),

    /// The request was denied; no job exists.
    Denied,
}

/// Errors from confirmation gate operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfirmError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Spec serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Audit log append failed.
    #[error("audit append failed: {0}")]
    Audit(#[from] AuditError),

    /// Registry error while creating the approved job.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Unknown request id.
    #[error("confirmation request not found: {request_id}")]
    NotFound {
        /// The unknown request id.
        request_id: String,
    },

    /// The idempotency key was seen before with a different payload.
    #[error("idempotency key '{key}' was used with a different payload")]
    IdempotencyConflict {
        /// The conflicting key.
        key: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt confirmation row for {request_id}: {details}")]
    CorruptRow {
        /// The request id.
        request_id: String,
        /// Details about the corruption.
        details: String,
    },
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// The confirmation gate.
///
/// Holds the static classification set, shares the registry's database for
/// durable request rows, and appends an audit event for every proposal and
/// every resolution.
pub struct ConfirmationGate {
    conn: Arc<Mutex<Connection>>,
    registry: Arc<JobRegistry>,
    audit: Arc<AuditLog>,
    critical_actions: HashSet<String>,
}

impl ConfirmationGate {
    /// Creates a gate over the given registry.
    ///
    /// `critical_actions` is the static classification map: actions named
    /// here are critical, everything else is routine.
    #[must_use]
    pub fn new(registry: Arc<JobRegistry>, critical_actions: HashSet<String>) -> Self {
        Self {
            conn: registry.connection(),
            audit: registry.audit_log(),
            registry,
            critical_actions,
        }
    }

    /// Classifies an action name.
    #[must_use]
    pub fn classify(&self, action: &str) -> ActionClass {
        if self.critical_actions.contains(action) {
            ActionClass::Critical
        } else {
            ActionClass::Routine
        }
    }

    /// Proposes an action.
    ///
    /// Routine actions are submitted to the registry immediately. Critical
    /// actions create a durable pending request — and no job — returning
    /// the request id the caller must have approved.
    ///
    /// # Errors
    ///
    /// Propagates registry errors for routine submissions and storage
    /// errors for critical proposals.
    pub fn propose(
        &self,
        spec: JobSpec,
        identity: Identity,
        idempotency_key: Option<String>,
    ) -> Result<ProposalOutcome, ConfirmError> {
        match self.classify(&spec.action) {
            ActionClass::Routine => {
                let mut request = SubmitRequest::new(spec, identity);
                request.idempotency_key = idempotency_key;
                Ok(ProposalOutcome::Submitted(self.registry.submit(request)?))
            }
            ActionClass::Critical => {
                let request_id = format!("cfm-{}", uuid::Uuid::new_v4());
                let correlation_id = uuid::Uuid::new_v4().to_string();
                let spec_digest = spec.digest()?;

                {
                    let conn = self.conn.lock().unwrap();

                    // The key maps to at most one live request, same as the
                    // registry's one-job-per-key contract. Check-then-insert
                    // is serialized by the connection lock.
                    if let Some(key) = &idempotency_key {
                        if let Some(existing) = Self::find_by_idempotency_key(&conn, key)? {
                            if existing.spec.digest()? == spec_digest {
                                tracing::debug!(
                                    request_id = %existing.request_id,
                                    key,
                                    "idempotent critical re-proposal"
                                );
                                return Ok(ProposalOutcome::PendingApproval {
                                    request_id: existing.request_id,
                                });
                            }
                            return Err(ConfirmError::IdempotencyConflict { key: key.clone() });
                        }
                    }

                    conn.execute(
                        "INSERT INTO confirmation_requests
                             (request_id, spec, status, created_at_ns, idempotency_key,
                              correlation_id, subject, roles)
                         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7)",
                        params![
                            request_id,
                            serde_json::to_string(&spec)?,
                            now_ns(),
                            idempotency_key,
                            correlation_id,
                            identity.subject,
                            serde_json::to_string(&identity.roles)?,
                        ],
                    )?;
                }

                self.audit.append(AuditEvent::new(
                    audit::CONFIRMATION_PROPOSED,
                    &correlation_id,
                    &identity,
                    digest_hex(&spec_digest),
                    serde_json::json!({
                        "request_id": request_id,
                        "action": spec.action,
                    }),
                ))?;

                tracing::info!(request_id, action = %spec.action, "critical action parked for approval");
                Ok(ProposalOutcome::PendingApproval { request_id })
            }
        }
    }

    /// Resolves a pending request.
    ///
    /// Approval deterministically produces exactly one job whose id is
    /// derived from the request id; retrying the resolve call returns the
    /// same job. Denial discards the request with an audit record and
    /// never produces a job. Resolving an already-resolved request
    /// returns the recorded outcome without a second audit event.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown request id.
    pub fn resolve(
        &self,
        request_id: &str,
        decision: Decision,
        approver: &Identity,
    ) -> Result<ResolutionOutcome, ConfirmError> {
        let request = self.get(request_id)?;

        match request.status {
            ConfirmationStatus::Approved => return self.recover_approved_job(&request, approver),
            ConfirmationStatus::Denied => return Ok(ResolutionOutcome::Denied),
            ConfirmationStatus::Pending => {}
        }

        // The request id fixes the job id, so approval is deterministic.
        let job_id = JobId::new(format!("job-{request_id}"));
        let (target, job_column): (ConfirmationStatus, Option<&str>) = match decision {
            Decision::Approve => (ConfirmationStatus::Approved, Some(job_id.as_str())),
            Decision::Deny => (ConfirmationStatus::Denied, None),
        };

        // CAS on (request_id, pending): exactly one resolver wins.
        let won = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE confirmation_requests
                 SET status = ?1, resolved_at_ns = ?2, job_id = ?3
                 WHERE request_id = ?4 AND status = 'pending'",
                params![target.as_str(), now_ns(), job_column, request_id],
            )? > 0
        };

        if !won {
            // Lost the race: report whatever the winner recorded.
            let resolved = self.get(request_id)?;
            return match resolved.status {
                ConfirmationStatus::Approved => self.recover_approved_job(&resolved, approver),
                _ => Ok(ResolutionOutcome::Denied),
            };
        }

        let spec_digest = request.spec.digest()?;
        match decision {
            Decision::Approve => {
                self.audit.append(AuditEvent::new(
                    audit::CONFIRMATION_APPROVED,
                    &request.correlation_id,
                    approver,
                    digest_hex(&spec_digest),
                    serde_json::json!({
                        "request_id": request_id,
                        "job_id": job_id.as_str(),
                    }),
                ))?;

                let mut submit = SubmitRequest::new(request.spec, request.identity)
                    .with_correlation_id(request.correlation_id);
                submit.job_id = Some(job_id);
                submit.idempotency_key = request.idempotency_key;
                let job = self.registry.submit(submit)?;
                tracing::info!(request_id, job_id = %job.id, "confirmation approved");
                Ok(ResolutionOutcome::Approved(job))
            }
            Decision::Deny => {
                self.audit.append(AuditEvent::new(
                    audit::CONFIRMATION_DENIED,
                    &request.correlation_id,
                    approver,
                    digest_hex(&spec_digest),
                    serde_json::json!({ "request_id": request_id }),
                ))?;
                tracing::info!(request_id, "confirmation denied");
                Ok(ResolutionOutcome::Denied)
            }
        }
    }

    /// Fetches a request by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, request_id: &str) -> Result<ConfirmationRequest, ConfirmError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT request_id, spec, status, created_at_ns, resolved_at_ns, job_id,
                        correlation_id, subject, roles, idempotency_key
                 FROM confirmation_requests WHERE request_id = ?1",
                params![request_id],
                Self::row_to_request,
            )
            .optional()?;
        row.ok_or_else(|| ConfirmError::NotFound {
            request_id: request_id.to_string(),
        })
    }

    /// Lists all pending requests, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending(&self) -> Result<Vec<ConfirmationRequest>, ConfirmError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT request_id, spec, status, created_at_ns, resolved_at_ns, job_id,
                    correlation_id, subject, roles, idempotency_key
             FROM confirmation_requests
             WHERE status = 'pending'
             ORDER BY created_at_ns ASC",
        )?;
        let requests = stmt
            .query_map([], Self::row_to_request)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// Returns the job for an already-approved request, repairing the
    /// crash window where the row was marked approved but the job was
    /// never inserted.
    fn recover_approved_job(
        &self,
        request: &ConfirmationRequest,
        _approver: &Identity,
    ) -> Result<ResolutionOutcome, ConfirmError> {
        let job_id = request
            .job_id
            .clone()
            .ok_or_else(|| ConfirmError::CorruptRow {
                request_id: request.request_id.clone(),
                details: "approved without job_id".to_string(),
            })?;

        match self.registry.get(&job_id) {
            Ok(job) => Ok(ResolutionOutcome::Approved(job)),
            Err(RegistryError::NotFound { .. }) => {
                // Approved but the job insert never happened: finish it now.
                let mut submit =
                    SubmitRequest::new(request.spec.clone(), request.identity.clone())
                        .with_correlation_id(request.correlation_id.clone());
                submit.job_id = Some(job_id);
                submit.idempotency_key = request.idempotency_key.clone();
                Ok(ResolutionOutcome::Approved(self.registry.submit(submit)?))
            }
            Err(other) => Err(other.into()),
        }
    }

    fn find_by_idempotency_key(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<ConfirmationRequest>, ConfirmError> {
        Ok(conn
            .query_row(
                "SELECT request_id, spec, status, created_at_ns, resolved_at_ns, job_id,
                        correlation_id, subject, roles, idempotency_key
                 FROM confirmation_requests
                 WHERE idempotency_key = ?1 AND status != 'denied'",
                params![key],
                Self::row_to_request,
            )
            .optional()?)
    }

    fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfirmationRequest> {
        let request_id: String = row.get(0)?;
        let request_id_out = request_id.clone();
        let spec_json: String = row.get(1)?;
        let status: String = row.get(2)?;
        let job_id: Option<String> = row.get(5)?;
        let roles_json: String = row.get(8)?;

        let corrupt = |details: &str| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("confirmation {request_id}: {details}"),
                )),
            )
        };

        Ok(ConfirmationRequest {
            spec: serde_json::from_str(&spec_json).map_err(|_| corrupt("spec is not valid JSON"))?,
            status: ConfirmationStatus::parse(&status).ok_or_else(|| corrupt("unknown status"))?,
            created_at_ns: row.get::<_, i64>(3)? as u64,
            resolved_at_ns: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
            job_id: job_id.map(JobId::new),
            idempotency_key: row.get(9)?,
            correlation_id: row.get(6)?,
            identity: Identity {
                subject: row.get(7)?,
                roles: serde_json::from_str(&roles_json).unwrap_or_default(),
            },
            request_id: request_id_out,
        })
    }
}
