//! Distributed-queue backend.
//!
//! Job ids are published to a [`Broker`]; consumer workers pull
//! deliveries, run one attempt each, and acknowledge. Delivery is
//! at-least-once: a delivery dropped without an ack is redelivered, and
//! the registry's claim compare-and-swap makes the duplicate a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::job::{Job, JobId};

use super::worker::{run_attempt, AttemptOutcome, ExecDeps};
use super::{BackendError, ExecutionBackend};

/// One message pulled from a broker.
///
/// Dropping a delivery without calling [`Delivery::ack`] requeues the
/// message for redelivery.
pub struct Delivery {
    job_id: JobId,
    acked: bool,
    redeliver: mpsc::UnboundedSender<JobId>,
}

impl Delivery {
    /// The job id carried by this delivery.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Acknowledges the delivery, consuming it.
    pub fn ack(mut self) {
        self.acked = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.acked {
            let _ = self.redeliver.send(self.job_id.clone());
        }
    }
}

/// Message-broker contract for the queue backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a job id for some consumer to pick up.
    ///
    /// # Errors
    ///
    /// Fails when the broker is closed or unreachable.
    async fn publish(&self, job_id: &JobId) -> Result<(), BackendError>;

    /// Pulls the next delivery, or `None` once the broker is closed and
    /// drained.
    async fn consume(&self) -> Option<Delivery>;

    /// Closes the broker; pending messages are still delivered.
    async fn close(&self);
}

/// In-process broker backed by an unbounded channel.
pub struct MemoryBroker {
    tx: mpsc::UnboundedSender<JobId>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an open broker with no pending messages.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            shutdown_tx,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, job_id: &JobId) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        self.tx
            .send(job_id.clone())
            .map_err(|_| BackendError::Closed)
    }

    async fn consume(&self) -> Option<Delivery> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut rx = self.rx.lock().await;
        loop {
            // Drain what's already queued before honoring shutdown.
            match rx.try_recv() {
                Ok(job_id) => {
                    return Some(Delivery {
                        job_id,
                        acked: false,
                        redeliver: self.tx.clone(),
                    });
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            tokio::select! {
                received = rx.recv() => {
                    return received.map(|job_id| Delivery {
                        job_id,
                        acked: false,
                        redeliver: self.tx.clone(),
                    });
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

/// Broker-fed consumer backend.
pub struct QueueBackend {
    broker: Arc<dyn Broker>,
    deps: ExecDeps,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueBackend {
    /// Spawns the consumer workers against the broker.
    #[must_use]
    pub fn start(deps: ExecDeps, broker: Arc<dyn Broker>, consumers: usize) -> Self {
        let mut handles = Vec::with_capacity(consumers.max(1));
        for consumer_idx in 0..consumers.max(1) {
            let broker = Arc::clone(&broker);
            let deps = deps.clone();
            handles.push(tokio::spawn(async move {
                while let Some(delivery) = broker.consume().await {
                    let job_id = delivery.job_id().clone();
                    match run_attempt(&deps, &job_id).await {
                        Ok(AttemptOutcome::Requeued(job)) => {
                            delivery.ack();
                            if let Err(err) = broker.publish(&job.id).await {
                                // The registry already holds it Queued; the
                                // next startup recovery pass re-publishes.
                                tracing::warn!(job_id = %job.id, error = %err, "requeue publish failed");
                            }
                        }
                        Ok(AttemptOutcome::Settled | AttemptOutcome::Skipped) => delivery.ack(),
                        Err(err) => {
                            tracing::error!(consumer_idx, job_id = %job_id, error = %err, "attempt failed");
                            delivery.ack();
                        }
                    }
                }
            }));
        }
        Self {
            broker,
            deps,
            consumers: Mutex::new(handles),
        }
    }
}

#[async_trait]
impl ExecutionBackend for QueueBackend {
    async fn enqueue(&self, job: &Job) -> Result<(), BackendError> {
        self.broker.publish(&job.id).await
    }

    async fn cancel(&self, job_id: &JobId) {
        self.deps.cancels.request(job_id);
    }

    async fn shutdown(&self) {
        self.broker.close().await;
        let handles: Vec<_> = std::mem::take(&mut *self.consumers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
