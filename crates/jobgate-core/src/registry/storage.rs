//! `SQLite`-backed job registry implementation.
//!
//! WAL mode with a mutex-guarded connection. State transitions use guarded
//! UPDATE statements — `WHERE id = ? AND status = ?` — so the database row
//! is the arbiter when concurrent actors race: the statement that matches
//! zero rows lost, and the loser re-reads to observe the winner's state.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use thiserror::Error;

use crate::audit::{self, AuditError, AuditEvent, AuditLog};
use crate::crypto::digest_hex;
use crate::identity::Identity;
use crate::job::{Job, JobFailure, JobId, JobKind, JobSpec, JobStatus};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, kind, status, action, payload, timeout_secs, max_retries, \
     spec_digest, submitted_at_ns, started_at_ns, completed_at_ns, attempt, \
     idempotency_key, external_ref, result_handle, failure, correlation_id, subject, roles";

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Audit log append failed. Submissions and transitions are not
    /// acknowledged without their audit event.
    #[error("audit append failed: {0}")]
    Audit(#[from] AuditError),

    /// The spec was rejected before any job was created.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Unknown job id.
    #[error("job not found: {job_id}")]
    NotFound {
        /// The unknown job id.
        job_id: String,
    },

    /// A job with this caller-supplied id already exists.
    #[error("job id already exists: {job_id}")]
    DuplicateId {
        /// The duplicate id.
        job_id: String,
    },

    /// The idempotency key was seen before with a different payload.
    #[error("idempotency key '{key}' was used with a different payload")]
    IdempotencyConflict {
        /// The conflicting key.
        key: String,
    },

    /// The requested edge is not in the legal-edge table. This is a logic
    /// bug in the caller, never a retryable condition.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        /// The job id.
        job_id: String,
        /// The status the job was actually in.
        from: JobStatus,
        /// The attempted target status.
        to: JobStatus,
    },

    /// A retry was requested with no retry budget left.
    #[error("retry budget exhausted for job {job_id} at attempt {attempt}")]
    RetryBudgetExhausted {
        /// The job id.
        job_id: String,
        /// The attempt count at which the budget ran out.
        attempt: u32,
    },

    /// A stored row could not be decoded.
    #[error("corrupt job row for {job_id}: {details}")]
    CorruptRow {
        /// The job id.
        job_id: String,
        /// Details about the corruption.
        details: String,
    },
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// What to run.
    pub spec: JobSpec,

    /// The submitting caller.
    pub identity: Identity,

    /// Caller-supplied job id; generated when absent.
    pub job_id: Option<JobId>,

    /// Idempotency key; repeated submissions with the same key and an
    /// identical payload return the original job unchanged.
    pub idempotency_key: Option<String>,

    /// Correlation id for audit threading; generated when absent.
    pub correlation_id: Option<String>,
}

impl SubmitRequest {
    /// Creates a plain submission with no id, key, or correlation override.
    #[must_use]
    pub fn new(spec: JobSpec, identity: Identity) -> Self {
        Self {
            spec,
            identity,
            job_id: None,
            idempotency_key: None,
            correlation_id: None,
        }
    }

    /// Sets the idempotency key (builder pattern).
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the correlation id (builder pattern).
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Per-transition metadata recorded on the job row and in the audit event.
#[derive(Debug, Clone, Default)]
pub struct TransitionMetadata {
    /// Free-form reason recorded in the audit detail ("retry", "timeout",
    /// "operator cancel", ...).
    pub reason: Option<String>,

    /// Terminal failure; required when transitioning to `Failed`.
    pub failure: Option<JobFailure>,

    /// Claim-check handle; required when transitioning to `Succeeded`.
    pub result_handle: Option<String>,

    /// Audit event type override. Defaults to
    /// [`audit::JOB_TRANSITIONED`].
    pub audit_event_type: Option<&'static str>,
}

impl TransitionMetadata {
    /// Metadata for a worker picking the job up.
    #[must_use]
    pub fn start() -> Self {
        Self::default()
    }

    /// Metadata for failing a job whose worker did not survive a restart.
    #[must_use]
    pub fn orphaned() -> Self {
        Self {
            failure: Some(JobFailure::orphaned()),
            audit_event_type: Some(audit::JOB_ORPHANED),
            ..Self::default()
        }
    }

    /// Metadata for a successful completion.
    #[must_use]
    pub fn succeeded(result_handle: impl Into<String>) -> Self {
        Self {
            result_handle: Some(result_handle.into()),
            ..Self::default()
        }
    }

    /// Metadata for a terminal failure.
    #[must_use]
    pub fn failed(failure: JobFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    /// Metadata for a retry re-queue.
    #[must_use]
    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Metadata for a cancellation.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Metadata for a backend-enforced timeout.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            reason: Some("per-job timeout elapsed".to_string()),
            ..Self::default()
        }
    }
}

/// Statistics about the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Jobs currently `Queued`.
    pub queued: u64,

    /// Jobs currently `Running`.
    pub running: u64,

    /// Jobs in any terminal state.
    pub terminal: u64,

    /// Confirmation requests still pending.
    pub pending_confirmations: u64,
}

/// The durable job registry.
pub struct JobRegistry {
    conn: Arc<Mutex<Connection>>,
    audit: Arc<AuditLog>,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl JobRegistry {
    /// Opens or creates a registry at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, audit: Arc<AuditLog>) -> Result<Self, RegistryError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            audit,
        })
    }

    /// Creates an in-memory registry for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory(audit: Arc<AuditLog>) -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            audit,
        })
    }

    /// The shared connection, used by the confirmation gate store which
    /// lives in the same database.
    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// The audit log this registry appends to.
    #[must_use]
    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    /// Submits a job, creating it in `Queued` state.
    ///
    /// Atomic with respect to idempotency-key collisions: the whole
    /// check-then-insert runs under the connection lock, so concurrent
    /// submissions with the same key serialize and exactly one job is
    /// created. A repeated submission with the same key and an identical
    /// payload returns the original job unchanged; the same key with a
    /// different payload is an [`RegistryError::IdempotencyConflict`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for a rejected spec, `DuplicateId` for a
    /// caller-supplied id that already exists, `IdempotencyConflict` for a
    /// key reuse with a different payload.
    pub fn submit(&self, request: SubmitRequest) -> Result<Job, RegistryError> {
        if request.spec.action.trim().is_empty() {
            return Err(RegistryError::InvalidSpec(
                "action name must not be empty".to_string(),
            ));
        }
        if request.spec.timeout_secs == 0 {
            return Err(RegistryError::InvalidSpec(
                "timeout_secs must be positive".to_string(),
            ));
        }

        let spec_digest = request.spec.digest()?;
        let job_id = request.job_id.unwrap_or_else(JobId::generate);
        let correlation_id = request
            .correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let job = {
            let conn = self.conn.lock().unwrap();

            if let Some(key) = &request.idempotency_key {
                if let Some(existing) = Self::find_by_idempotency_key(&conn, key)? {
                    if existing.spec_digest == spec_digest {
                        tracing::debug!(job_id = %existing.id, key, "idempotent resubmission");
                        return Ok(existing);
                    }
                    return Err(RegistryError::IdempotencyConflict { key: key.clone() });
                }
            }

            if Self::find_by_id(&conn, &job_id)?.is_some() {
                return Err(RegistryError::DuplicateId {
                    job_id: job_id.to_string(),
                });
            }

            let job = Job {
                id: job_id,
                kind: request.spec.kind,
                status: JobStatus::Queued,
                spec_digest,
                submitted_at_ns: now_ns(),
                started_at_ns: None,
                completed_at_ns: None,
                attempt: 1,
                idempotency_key: request.idempotency_key,
                external_ref: None,
                result_handle: None,
                failure: None,
                correlation_id,
                identity: request.identity,
                spec: request.spec,
            };

            conn.execute(
                &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"),
                params![
                    job.id.as_str(),
                    job.kind.as_str(),
                    job.status.as_str(),
                    job.spec.action,
                    serde_json::to_string(&job.spec.payload)?,
                    job.spec.timeout_secs,
                    job.spec.max_retries,
                    job.spec_digest.as_slice(),
                    job.submitted_at_ns,
                    job.started_at_ns,
                    job.completed_at_ns,
                    job.attempt,
                    job.idempotency_key,
                    job.external_ref,
                    job.result_handle,
                    Option::<String>::None,
                    job.correlation_id,
                    job.identity.subject,
                    serde_json::to_string(&job.identity.roles)?,
                ],
            )?;
            job
        };

        self.audit.append(AuditEvent::new(
            audit::JOB_SUBMITTED,
            &job.correlation_id,
            &job.identity,
            digest_hex(&job.spec_digest),
            serde_json::json!({
                "job_id": job.id.as_str(),
                "action": job.spec.action,
                "kind": job.kind.as_str(),
            }),
        ))?;

        tracing::info!(job_id = %job.id, action = %job.spec.action, "job submitted");
        Ok(job)
    }

    /// Fetches a job by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn get(&self, job_id: &JobId) -> Result<Job, RegistryError> {
        let conn = self.conn.lock().unwrap();
        Self::find_by_id(&conn, job_id)?.ok_or_else(|| RegistryError::NotFound {
            job_id: job_id.to_string(),
        })
    }

    /// Transitions a job along a legal edge with compare-and-swap on
    /// `(id, expected_status)`.
    ///
    /// Exactly one concurrent caller wins a given edge. A caller that
    /// loses the race to another caller taking the *same* edge observes
    /// the new state and no-ops (returns the job without appending a
    /// second audit event). Any other mismatch is an
    /// [`RegistryError::IllegalTransition`], which callers must treat as
    /// a logic bug, not a retryable condition.
    ///
    /// The `Running -> Queued` edge is the retry edge: it increments the
    /// attempt counter inside the same guarded UPDATE and fails with
    /// [`RegistryError::RetryBudgetExhausted`] once
    /// `attempt > max_retries`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `IllegalTransition`, or `RetryBudgetExhausted` as
    /// described above.
    pub fn transition(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
        metadata: TransitionMetadata,
    ) -> Result<Job, RegistryError> {
        if !from.can_transition_to(to) {
            return Err(RegistryError::IllegalTransition {
                job_id: job_id.to_string(),
                from,
                to,
            });
        }

        let job = {
            let conn = self.conn.lock().unwrap();
            let now = now_ns();

            let affected = if from == JobStatus::Running && to == JobStatus::Queued {
                // Retry edge: attempt increments atomically with the CAS,
                // and the budget guard lives in the same statement so a
                // crashed worker can never double-increment.
                conn.execute(
                    "UPDATE jobs SET status = ?1, attempt = attempt + 1
                     WHERE id = ?2 AND status = ?3 AND attempt <= max_retries",
                    params![to.as_str(), job_id.as_str(), from.as_str()],
                )?
            } else {
                let failure_json = metadata
                    .failure
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let started_at = (to == JobStatus::Running).then_some(now);
                let completed_at = to.is_terminal().then_some(now);
                conn.execute(
                    "UPDATE jobs SET status = ?1,
                         started_at_ns = COALESCE(?2, started_at_ns),
                         completed_at_ns = COALESCE(?3, completed_at_ns),
                         result_handle = COALESCE(?4, result_handle),
                         failure = COALESCE(?5, failure)
                     WHERE id = ?6 AND status = ?7",
                    params![
                        to.as_str(),
                        started_at,
                        completed_at,
                        metadata.result_handle,
                        failure_json,
                        job_id.as_str(),
                        from.as_str(),
                    ],
                )?
            };

            let job = Self::find_by_id(&conn, job_id)?.ok_or_else(|| RegistryError::NotFound {
                job_id: job_id.to_string(),
            })?;

            if affected == 0 {
                if job.status == to {
                    // Lost the race to a caller taking the same edge:
                    // observe the new state and no-op.
                    return Ok(job);
                }
                if from == JobStatus::Running
                    && to == JobStatus::Queued
                    && job.status == JobStatus::Running
                {
                    return Err(RegistryError::RetryBudgetExhausted {
                        job_id: job_id.to_string(),
                        attempt: job.attempt,
                    });
                }
                return Err(RegistryError::IllegalTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to,
                });
            }

            job
        };

        let mut event = AuditEvent::new(
            metadata.audit_event_type.unwrap_or(audit::JOB_TRANSITIONED),
            &job.correlation_id,
            &job.identity,
            digest_hex(&job.spec_digest),
            serde_json::json!({
                "job_id": job.id.as_str(),
                "from": from.as_str(),
                "to": to.as_str(),
                "attempt": job.attempt,
                "reason": metadata.reason,
                "failure": job.failure,
            }),
        );
        if let Some(handle) = &job.result_handle {
            // Blob handles are content digests, so the handle doubles as
            // the result digest.
            event = event.with_result_digest(handle.clone());
        }
        self.audit.append(event)?;

        tracing::info!(
            job_id = %job.id,
            from = %from,
            to = %to,
            attempt = job.attempt,
            "job transitioned"
        );
        Ok(job)
    }

    /// Claims a `Queued` job for execution, transitioning it to `Running`.
    ///
    /// This is the dequeue-side arbiter: the `(id, Queued)` guard means a
    /// job cancelled (or claimed by another worker) a moment earlier loses
    /// the claim, so a cancelled `Queued` job is never executed. Returns
    /// `None` when the claim was lost; the winner gets the job and exactly
    /// one audit event is appended.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn claim_for_run(
        &self,
        job_id: &JobId,
        metadata: TransitionMetadata,
    ) -> Result<Option<Job>, RegistryError> {
        let job = {
            let conn = self.conn.lock().unwrap();
            let affected = conn.execute(
                "UPDATE jobs SET status = 'running', started_at_ns = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![now_ns(), job_id.as_str()],
            )?;

            let job = Self::find_by_id(&conn, job_id)?.ok_or_else(|| RegistryError::NotFound {
                job_id: job_id.to_string(),
            })?;

            if affected == 0 {
                tracing::debug!(job_id = %job_id, status = %job.status, "claim lost");
                return Ok(None);
            }
            job
        };

        self.audit.append(AuditEvent::new(
            metadata.audit_event_type.unwrap_or(audit::JOB_TRANSITIONED),
            &job.correlation_id,
            &job.identity,
            digest_hex(&job.spec_digest),
            serde_json::json!({
                "job_id": job.id.as_str(),
                "from": JobStatus::Queued.as_str(),
                "to": JobStatus::Running.as_str(),
                "attempt": job.attempt,
                "reason": metadata.reason,
            }),
        ))?;

        tracing::info!(job_id = %job.id, attempt = job.attempt, "job claimed for execution");
        Ok(Some(job))
    }

    /// Records the external scheduler reference on a job.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn set_external_ref(
        &self,
        job_id: &JobId,
        external_ref: &str,
    ) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE jobs SET external_ref = ?1 WHERE id = ?2",
            params![external_ref, job_id.as_str()],
        )?;
        if affected == 0 {
            return Err(RegistryError::NotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Lists all jobs in a non-terminal state (`Queued` or `Running`).
    ///
    /// Used on startup to resume or repair work left over from a prior
    /// process.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_active(&self) -> Result<Vec<Job>, RegistryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status IN ('queued', 'running')
             ORDER BY submitted_at_ns ASC"
        ))?;
        let jobs = stmt
            .query_map([], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Deletes terminal jobs whose terminal transition is older than the
    /// cutoff, returning the deleted jobs so the caller can reclaim their
    /// result handles and emit purge audit events.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn purge_terminal_older_than(&self, cutoff_ns: u64) -> Result<Vec<Job>, RegistryError> {
        // Timestamps are stored as SQLite integers (i64); a cutoff past
        // i64::MAX covers every representable completion time.
        let cutoff_ns = i64::try_from(cutoff_ns).unwrap_or(i64::MAX);
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status IN ('succeeded', 'failed', 'timed_out', 'cancelled')
               AND completed_at_ns IS NOT NULL
               AND completed_at_ns < ?1"
        ))?;
        let expired = stmt
            .query_map(params![cutoff_ns], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for job in &expired {
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![job.id.as_str()])?;
        }

        Ok(expired)
    }

    /// Gets statistics about the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let conn = self.conn.lock().unwrap();
        let count = |sql: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|v| v as u64)
        };

        Ok(RegistryStats {
            queued: count("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")?,
            running: count("SELECT COUNT(*) FROM jobs WHERE status = 'running'")?,
            terminal: count(
                "SELECT COUNT(*) FROM jobs
                 WHERE status IN ('succeeded', 'failed', 'timed_out', 'cancelled')",
            )?,
            pending_confirmations: count(
                "SELECT COUNT(*) FROM confirmation_requests WHERE status = 'pending'",
            )?,
        })
    }

    fn find_by_id(conn: &Connection, job_id: &JobId) -> Result<Option<Job>, RegistryError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"
        ))?;
        Ok(stmt
            .query_row(params![job_id.as_str()], Self::row_to_job)
            .optional()?)
    }

    fn find_by_idempotency_key(
        conn: &Connection,
        key: &str,
    ) -> Result<Option<Job>, RegistryError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = ?1"
        ))?;
        Ok(stmt
            .query_row(params![key], Self::row_to_job)
            .optional()?)
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
        let id: String = row.get(0)?;
        let job_id = JobId::new(id.clone());
        let kind: String = row.get(1)?;
        let status: String = row.get(2)?;
        let payload_json: String = row.get(4)?;
        let spec_digest: Vec<u8> = row.get(7)?;
        let failure_json: Option<String> = row.get(15)?;
        let roles_json: String = row.get(18)?;

        let corrupt = |details: &str| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("job {id}: {details}"),
                )),
            )
        };

        Ok(Job {
            spec: JobSpec {
                action: row.get(3)?,
                payload: serde_json::from_str(&payload_json)
                    .map_err(|_| corrupt("payload is not valid JSON"))?,
                kind: JobKind::parse(&kind).ok_or_else(|| corrupt("unknown kind"))?,
                timeout_secs: row.get::<_, i64>(5)? as u64,
                max_retries: row.get::<_, i64>(6)? as u32,
            },
            kind: JobKind::parse(&kind).ok_or_else(|| corrupt("unknown kind"))?,
            status: JobStatus::parse(&status).ok_or_else(|| corrupt("unknown status"))?,
            spec_digest: spec_digest
                .try_into()
                .map_err(|_| corrupt("spec digest has wrong length"))?,
            submitted_at_ns: row.get::<_, i64>(8)? as u64,
            started_at_ns: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
            completed_at_ns: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
            attempt: row.get::<_, i64>(11)? as u32,
            idempotency_key: row.get(12)?,
            external_ref: row.get(13)?,
            result_handle: row.get(14)?,
            failure: failure_json
                .map(|json| {
                    serde_json::from_str::<JobFailure>(&json)
                        .map_err(|_| corrupt("failure is not valid JSON"))
                })
                .transpose()?,
            correlation_id: row.get(16)?,
            identity: Identity {
                subject: row.get(17)?,
                roles: serde_json::from_str(&roles_json).unwrap_or_default(),
            },
            id: job_id,
        })
    }
}
