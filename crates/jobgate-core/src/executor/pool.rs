//! In-process worker pool backend.
//!
//! A bounded mpsc channel feeds a fixed set of worker tasks. Each worker
//! claims a job through the registry and runs one attempt; a re-queued
//! job is pushed back onto the same channel. Workers hold only a weak
//! sender, so dropping the pool's sender on shutdown closes the channel
//! and drains the workers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::job::{Job, JobId};

use super::worker::{run_attempt, AttemptOutcome, ExecDeps};
use super::{BackendError, Backpressure, ExecutionBackend};

/// Fixed-size in-process worker pool.
pub struct PoolBackend {
    tx: Mutex<Option<mpsc::Sender<JobId>>>,
    backpressure: Backpressure,
    deps: ExecDeps,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolBackend {
    /// Spawns the worker tasks and returns the running pool.
    #[must_use]
    pub fn start(
        deps: ExecDeps,
        workers: usize,
        queue_depth: usize,
        backpressure: Backpressure,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<JobId>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers.max(1));
        for worker_idx in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let requeue_tx = tx.downgrade();
            let deps = deps.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job_id = {
                        let mut rx = rx.lock().await;
                        match rx.recv().await {
                            Some(id) => id,
                            None => break,
                        }
                    };
                    match run_attempt(&deps, &job_id).await {
                        Ok(AttemptOutcome::Requeued(job)) => {
                            // A failed upgrade means shutdown mid-retry; the
                            // job stays Queued and is re-enqueued by the next
                            // startup recovery pass.
                            if let Some(tx) = requeue_tx.upgrade() {
                                let _ = tx.send(job.id).await;
                            }
                        }
                        Ok(AttemptOutcome::Settled | AttemptOutcome::Skipped) => {}
                        Err(err) => {
                            tracing::error!(worker_idx, job_id = %job_id, error = %err, "attempt failed");
                        }
                    }
                }
            }));
        }

        Self {
            tx: Mutex::new(Some(tx)),
            backpressure,
            deps,
            workers: Mutex::new(handles),
        }
    }
}

#[async_trait]
impl ExecutionBackend for PoolBackend {
    async fn enqueue(&self, job: &Job) -> Result<(), BackendError> {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(BackendError::Closed)?;
        match self.backpressure {
            Backpressure::Block => tx
                .send(job.id.clone())
                .await
                .map_err(|_| BackendError::Closed),
            Backpressure::FailFast => tx.try_send(job.id.clone()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BackendError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => BackendError::Closed,
            }),
        }
    }

    async fn cancel(&self, job_id: &JobId) {
        self.deps.cancels.request(job_id);
    }

    async fn shutdown(&self) {
        drop(self.tx.lock().unwrap().take());
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
