/// Dispatcher - turns queue deliveries into claimed jobs on worker slots
///
/// The queue delivers at least once; the store's conditional
/// `pending → running` claim makes execution at most once per job. A
/// delivery is acknowledged only after the job is finalized, or when there
/// is nothing to do for it.
use psjudge_common::queue::{Delivery, JobQueue};
use psjudge_common::store::{ClaimOutcome, JobStore};
use psjudge_common::types::BuildStatus;
use psjudge_common::JudgeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::executor::BuildExecutor;
use crate::metrics::DUPLICATE_DELIVERIES;
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Claimed and running on a slot
    Admitted,
    /// No such build; delivery dropped
    Missing,
    /// Already claimed or finished; delivery dropped
    Duplicate(BuildStatus),
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    pool: WorkerPool,
    executor: Arc<BuildExecutor>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        pool: WorkerPool,
        executor: Arc<BuildExecutor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            executor,
            poll_interval,
        }
    }

    /// Handle one delivery. Waits for a free slot when the job is claimed,
    /// then returns while the job runs in the background.
    #[tracing::instrument(skip(self, delivery), fields(uuid = %delivery.uuid))]
    pub async fn dispatch(&self, delivery: Delivery) -> Result<DispatchOutcome, JudgeError> {
        let Some(job) = self.store.build(&delivery.uuid).await? else {
            warn!("Build not found, dropping delivery");
            self.queue.ack(&delivery).await?;
            return Ok(DispatchOutcome::Missing);
        };

        let now = chrono::Utc::now().timestamp_millis();
        match self.store.claim(&job.uuid, now).await? {
            ClaimOutcome::Missing => {
                warn!("Build vanished before claim, dropping delivery");
                self.queue.ack(&delivery).await?;
                Ok(DispatchOutcome::Missing)
            }
            ClaimOutcome::AlreadyClaimed(status) => {
                DUPLICATE_DELIVERIES.inc();
                debug!(status = %status, "Duplicate delivery dropped");
                self.queue.ack(&delivery).await?;
                Ok(DispatchOutcome::Duplicate(status))
            }
            ClaimOutcome::Claimed => {
                let slot = self
                    .pool
                    .acquire()
                    .await
                    .map_err(|e| JudgeError::Internal(format!("worker pool closed: {}", e)))?;
                info!(
                    slot = slot.id(),
                    free_slots = self.pool.available(),
                    language = %job.language,
                    "Build admitted"
                );

                let executor = self.executor.clone();
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    match executor.execute(&job, slot.id()).await {
                        Ok(_) => {
                            if let Err(e) = queue.ack(&delivery).await {
                                warn!(uuid = %job.uuid, error = %e, "Failed to ack delivery");
                            }
                        }
                        Err(e) => {
                            // Lease expiry and the reaper bring the job back
                            error!(uuid = %job.uuid, error = %e, "Failed to finalize build, delivery left unacked");
                        }
                    }
                    drop(slot);
                });
                Ok(DispatchOutcome::Admitted)
            }
        }
    }

    /// Receive and dispatch until `shutdown` flips, then wait for running
    /// jobs to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(slots = self.pool.size(), "Dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                received = self.queue.receive() => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.dispatch(delivery).await {
                        // Unacked; the lease expires and the queue redelivers
                        error!(error = %e, "Dispatch failed");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Queue error");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("Dispatcher stopped, draining slots");
        if let Err(e) = self.pool.wait_idle().await {
            warn!(error = %e, "Failed to drain worker pool");
        }
    }
}
