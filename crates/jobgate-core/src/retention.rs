//! Bounded-history retention.
//!
//! Jobs in a terminal state older than the retention window are deleted
//! from the registry, their claim-check payloads are reclaimed, and a
//! purge event is written to the audit log for each. The audit log itself
//! is never pruned; the purge events are the durable trace of what was
//! removed.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::{self, AuditError, AuditEvent};
use crate::blob::{BlobError, BlobStore};
use crate::crypto::digest_hex;
use crate::identity::Identity;
use crate::registry::{JobRegistry, RegistryError};

/// Errors from retention sweeps.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RetentionError {
    /// Registry interaction failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Audit append failed.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),
}

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs deleted from the registry.
    pub jobs_purged: u64,

    /// Result payloads reclaimed from the claim-check store.
    pub blobs_reclaimed: u64,
}

/// Sweeps expired terminal jobs out of the registry.
pub struct RetentionManager {
    registry: Arc<JobRegistry>,
    blob: Arc<dyn BlobStore>,
    window: Duration,
}

impl RetentionManager {
    /// Creates a manager purging terminal jobs older than `window`.
    #[must_use]
    pub fn new(registry: Arc<JobRegistry>, blob: Arc<dyn BlobStore>, window: Duration) -> Self {
        Self {
            registry,
            blob,
            window,
        }
    }

    /// Runs one sweep: purge expired terminal jobs, reclaim their result
    /// payloads, and record one purge event per job.
    ///
    /// # Errors
    ///
    /// Returns an error when the registry delete or an audit append
    /// fails; blob reclaim failures are logged and skipped (the handle is
    /// content-addressed and may be shared).
    pub fn run_once(&self) -> Result<SweepReport, RetentionError> {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let cutoff_ns = now_ns.saturating_sub(self.window.as_nanos() as u64);

        let expired = self.registry.purge_terminal_older_than(cutoff_ns)?;
        let mut report = SweepReport::default();
        let sweeper = Identity::system();

        for job in &expired {
            if let Some(handle) = &job.result_handle {
                match self.blob.delete(&crate::blob::BlobHandle::new(handle)) {
                    Ok(()) => report.blobs_reclaimed += 1,
                    Err(BlobError::NotFound { .. }) => {}
                    Err(err) => {
                        tracing::warn!(job_id = %job.id, error = %err, "blob reclaim failed");
                    }
                }
            }
            self.registry.audit_log().append(AuditEvent::new(
                audit::JOB_PURGED,
                &job.correlation_id,
                &sweeper,
                digest_hex(&job.spec_digest),
                serde_json::json!({
                    "job_id": job.id.as_str(),
                    "status": job.status.as_str(),
                    "completed_at_ns": job.completed_at_ns,
                }),
            ))?;
            report.jobs_purged += 1;
        }

        if report.jobs_purged > 0 {
            tracing::info!(
                jobs_purged = report.jobs_purged,
                blobs_reclaimed = report.blobs_reclaimed,
                "retention sweep complete"
            );
        }
        Ok(report)
    }

    /// Spawns a periodic sweep task that stops when the shutdown signal
    /// flips to `true`.
    #[must_use]
    pub fn spawn(
        self: Arc<Self>,
        sweep_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if let Err(err) = self.run_once() {
                    tracing::error!(error = %err, "retention sweep failed");
                }
            }
        })
    }
}
