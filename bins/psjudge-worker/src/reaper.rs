// Stale-job reaper.
//
// Each sweep puts expired queue leases back on the queue, then resets builds
// stuck in `running` for longer than the stale bound to `pending` and
// republishes them. A reset build stays in the store's requeue set until its
// publish succeeds, so a failed publish is retried by the next sweep.
// Running builds are kept fresh by the executor's heartbeat.

use psjudge_common::queue::JobQueue;
use psjudge_common::store::JobStore;
use psjudge_common::JudgeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::metrics::STALE_RESETS;

pub struct Reaper {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    stale_after: Duration,
    interval: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub reset: Vec<String>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        stale_after: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            stale_after,
            interval,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, JudgeError> {
        let requeued = self.queue.requeue_expired().await?;
        if requeued > 0 {
            info!(requeued, "Requeued deliveries with expired leases");
        }

        let cutoff = chrono::Utc::now().timestamp_millis() - self.stale_after.as_millis() as i64;
        let awaiting = self.store.reset_stale(cutoff).await?;

        let mut reset = Vec::with_capacity(awaiting.len());
        for uuid in awaiting {
            if let Err(e) = self.queue.publish(&uuid).await {
                warn!(uuid = %uuid, error = %e, "Failed to republish reset build, retrying next sweep");
                continue;
            }
            self.store.confirm_requeued(&uuid).await?;
            warn!(uuid = %uuid, "Reset stale running build to pending");
            STALE_RESETS.inc();
            reset.push(uuid);
        }

        Ok(SweepReport { requeued, reset })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) => debug!(
                            requeued = report.requeued,
                            reset = report.reset.len(),
                            "Reaper sweep finished"
                        ),
                        Err(e) => error!(error = %e, "Reaper sweep failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use psjudge_common::api::BuildFinishedEvent;
    use psjudge_common::memory::{MemoryQueue, MemoryStore};
    use psjudge_common::queue::Delivery;
    use psjudge_common::store::ClaimOutcome;
    use psjudge_common::types::{BuildJob, BuildStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Queue whose first `failures` publishes are rejected.
    struct FailingPublishQueue {
        inner: MemoryQueue,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for FailingPublishQueue {
        async fn publish(&self, uuid: &str) -> psjudge_common::Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(JudgeError::Internal("connection reset".into()));
            }
            self.inner.publish(uuid).await
        }

        async fn receive(&self) -> psjudge_common::Result<Option<Delivery>> {
            self.inner.receive().await
        }

        async fn ack(&self, delivery: &Delivery) -> psjudge_common::Result<()> {
            self.inner.ack(delivery).await
        }

        async fn requeue_expired(&self) -> psjudge_common::Result<usize> {
            self.inner.requeue_expired().await
        }

        async fn notify_finished(&self, event: &BuildFinishedEvent) -> psjudge_common::Result<()> {
            self.inner.notify_finished(event).await
        }
    }

    #[tokio::test]
    async fn test_sweep_resets_and_republishes_stale_jobs() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        store
            .register_build(&BuildJob::new("old", "a1", "sh", "echo"))
            .await
            .unwrap();
        store
            .register_build(&BuildJob::new("fresh", "a1", "sh", "echo"))
            .await
            .unwrap();

        let now = chrono::Utc::now().timestamp_millis();
        store.claim("old", now - 3_600_000).await.unwrap();
        store.claim("fresh", now).await.unwrap();

        let reaper = Reaper::new(
            store.clone(),
            queue.clone(),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );
        let report = reaper.sweep().await.unwrap();

        assert_eq!(report.reset, vec!["old".to_string()]);
        assert_eq!(queue.pending_len().await, 1);
        assert_eq!(
            store.build("old").await.unwrap().unwrap().status,
            BuildStatus::Pending
        );
        assert_eq!(
            store.build("fresh").await.unwrap().unwrap().status,
            BuildStatus::Running
        );
        // The reset job can be claimed again
        assert_eq!(store.claim("old", now).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_sweep_requeues_expired_leases() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(0)));
        queue.publish("b1").await.unwrap();
        queue.receive().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaper = Reaper::new(store, queue.clone(), Duration::from_secs(600), Duration::from_secs(30));
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_republish_is_retried_next_sweep() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(FailingPublishQueue {
            inner: MemoryQueue::new(Duration::from_secs(60)),
            failures: AtomicUsize::new(1),
        });
        store
            .register_build(&BuildJob::new("b1", "a1", "sh", "echo"))
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        store.claim("b1", now - 3_600_000).await.unwrap();

        let reaper = Reaper::new(
            store.clone(),
            queue.clone(),
            Duration::from_secs(600),
            Duration::from_secs(30),
        );

        let first = reaper.sweep().await.unwrap();
        assert!(first.reset.is_empty());
        assert_eq!(queue.inner.pending_len().await, 0);
        assert_eq!(
            store.build("b1").await.unwrap().unwrap().status,
            BuildStatus::Pending
        );

        let second = reaper.sweep().await.unwrap();
        assert_eq!(second.reset, vec!["b1".to_string()]);
        assert_eq!(queue.inner.pending_len().await, 1);

        // Confirmed, so later sweeps leave it alone
        let third = reaper.sweep().await.unwrap();
        assert!(third.reset.is_empty());
        assert_eq!(queue.inner.pending_len().await, 1);
    }
}
