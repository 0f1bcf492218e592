/// Status Publisher - writes progress and terminal reports back to the store
///
/// Finalization is conditional in the store, so calling it twice, or after
/// another delivery already finished the job, is a no-op.
use psjudge_common::api::BuildFinishedEvent;
use psjudge_common::queue::JobQueue;
use psjudge_common::store::JobStore;
use psjudge_common::types::{BuildReport, BuildStatus, RunningPhase};
use psjudge_common::JudgeError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics::BUILDS_FINISHED;

const FINALIZE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct StatusPublisher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    retry_delay: Duration,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Progress markers are advisory; a failed write is only logged.
    pub async fn phase(&self, uuid: &str, phase: RunningPhase) {
        match self.store.set_phase(uuid, phase).await {
            Ok(true) => debug!(uuid = %uuid, phase = phase.as_str(), "Phase updated"),
            Ok(false) => warn!(uuid = %uuid, phase = phase.as_str(), "Job no longer running"),
            Err(e) => warn!(uuid = %uuid, error = %e, "Failed to update phase"),
        }
    }

    /// Refresh the claim time of a running job. Like phase markers, a failed
    /// write is only logged; the reaper decides what counts as stale.
    pub async fn heartbeat(&self, uuid: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        match self.store.heartbeat(uuid, now).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(uuid = %uuid, "Heartbeat for a job that is no longer running");
                false
            }
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "Failed to write heartbeat");
                false
            }
        }
    }

    /// Write the terminal report. Returns `Ok(false)` when the job was already
    /// terminal. Infrastructure errors are retried with backoff before being
    /// returned.
    pub async fn finalize(&self, uuid: &str, report: &BuildReport) -> Result<bool, JudgeError> {
        let mut attempt = 1;
        let written = loop {
            match self.store.finalize(uuid, report).await {
                Ok(written) => break written,
                Err(e) if e.is_infrastructure() && attempt < FINALIZE_ATTEMPTS => {
                    warn!(uuid = %uuid, attempt, error = %e, "Finalize failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        if !written {
            info!(uuid = %uuid, "Job already terminal, report not overwritten");
            return Ok(false);
        }

        BUILDS_FINISHED.with_label_values(&[report.status.as_str()]).inc();
        info!(
            uuid = %uuid,
            status = %report.status,
            score = report.score,
            tests_passed = report.tests_passed,
            tests_total = report.tests_total,
            "Build finalized"
        );

        let event = BuildFinishedEvent {
            key: uuid.to_string(),
            succeed: report.status == BuildStatus::Passed,
        };
        if let Err(e) = self.queue.notify_finished(&event).await {
            warn!(uuid = %uuid, error = %e, "Failed to publish build-finished event");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use psjudge_common::memory::{MemoryQueue, MemoryStore};
    use psjudge_common::store::{ClaimOutcome, Registration};
    use psjudge_common::types::{BuildJob, TestCase};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store whose finalize fails with a storage error a fixed number of times
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn register_build(&self, job: &BuildJob) -> psjudge_common::Result<Registration> {
            self.inner.register_build(job).await
        }
        async fn build(&self, uuid: &str) -> psjudge_common::Result<Option<BuildJob>> {
            self.inner.build(uuid).await
        }
        async fn register_test_case(&self, case: &TestCase) -> psjudge_common::Result<Registration> {
            self.inner.register_test_case(case).await
        }
        async fn test_cases(&self, assignment_uuid: &str) -> psjudge_common::Result<Vec<TestCase>> {
            self.inner.test_cases(assignment_uuid).await
        }
        async fn claim(&self, uuid: &str, now_ms: i64) -> psjudge_common::Result<ClaimOutcome> {
            self.inner.claim(uuid, now_ms).await
        }
        async fn set_phase(&self, uuid: &str, phase: RunningPhase) -> psjudge_common::Result<bool> {
            self.inner.set_phase(uuid, phase).await
        }
        async fn finalize(&self, uuid: &str, report: &BuildReport) -> psjudge_common::Result<bool> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(JudgeError::Internal("connection reset".into()));
            }
            self.inner.finalize(uuid, report).await
        }
        async fn heartbeat(&self, uuid: &str, now_ms: i64) -> psjudge_common::Result<bool> {
            self.inner.heartbeat(uuid, now_ms).await
        }
        async fn reset_stale(&self, cutoff_ms: i64) -> psjudge_common::Result<Vec<String>> {
            self.inner.reset_stale(cutoff_ms).await
        }
        async fn confirm_requeued(&self, uuid: &str) -> psjudge_common::Result<()> {
            self.inner.confirm_requeued(uuid).await
        }
    }

    async fn claimed_store(failures: u32) -> Arc<FlakyStore> {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
        });
        store
            .register_build(&BuildJob::new("b1", "a1", "sh", "echo"))
            .await
            .unwrap();
        store.claim("b1", 1).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_finalize_once_and_emit_event() {
        let store = claimed_store(0).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let publisher = StatusPublisher::new(store.clone(), queue.clone());

        let report = BuildReport::compilation_failed("syntax error".into(), false);
        assert!(publisher.finalize("b1", &report).await.unwrap());
        assert!(!publisher.finalize("b1", &report).await.unwrap());

        let events = queue.finished_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "b1");
        assert!(!events[0].succeed);
    }

    #[tokio::test]
    async fn test_finalize_retries_infrastructure_errors() {
        let store = claimed_store(2).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let publisher =
            StatusPublisher::new(store.clone(), queue).with_retry_delay(Duration::from_millis(1));

        let report = BuildReport::unsupported_language("cobol");
        assert!(publisher.finalize("b1", &report).await.unwrap());
        let job = store.build("b1").await.unwrap().unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_finalize_gives_up_after_attempts() {
        let store = claimed_store(FINALIZE_ATTEMPTS).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let publisher =
            StatusPublisher::new(store.clone(), queue).with_retry_delay(Duration::from_millis(1));

        let report = BuildReport::unsupported_language("cobol");
        assert!(publisher.finalize("b1", &report).await.is_err());
        let job = store.build("b1").await.unwrap().unwrap();
        assert_eq!(job.status, BuildStatus::Running);
    }

    #[tokio::test]
    async fn test_phase_on_finished_job_is_harmless() {
        let store = claimed_store(0).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let publisher = StatusPublisher::new(store.clone(), queue);

        publisher.phase("b1", RunningPhase::Testing).await;
        assert_eq!(store.build("b1").await.unwrap().unwrap().details, "testing");

        let report = BuildReport::compilation_failed(String::new(), true);
        publisher.finalize("b1", &report).await.unwrap();
        publisher.phase("b1", RunningPhase::Testing).await;
        assert_eq!(
            store.build("b1").await.unwrap().unwrap().details,
            "compilation timed out"
        );
    }

    #[tokio::test]
    async fn test_heartbeat_only_touches_running_jobs() {
        let store = claimed_store(0).await;
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let publisher = StatusPublisher::new(store.clone(), queue);

        assert!(publisher.heartbeat("b1").await);
        let claimed_at = store.build("b1").await.unwrap().unwrap().claimed_at;
        assert!(claimed_at.unwrap() > 1);

        let report = BuildReport::unsupported_language("cobol");
        publisher.finalize("b1", &report).await.unwrap();
        assert!(!publisher.heartbeat("b1").await);
        assert!(!publisher.heartbeat("ghost").await);
    }
}
