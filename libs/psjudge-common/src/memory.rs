// In-process store and queue with the same semantics as the Redis
// implementations. Used by tests and single-process setups.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::api::BuildFinishedEvent;
use crate::error::{JudgeError, Result};
use crate::queue::{Delivery, JobQueue};
use crate::store::{ClaimOutcome, JobStore, Registration};
use crate::types::{BuildJob, BuildReport, BuildStatus, RunningPhase, TestCase};

#[derive(Default)]
struct StoreState {
    builds: HashMap<String, BuildJob>,
    test_cases: HashMap<String, TestCase>,
    by_assignment: HashMap<String, Vec<String>>,
    awaiting_requeue: BTreeSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn register_build(&self, job: &BuildJob) -> Result<Registration> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.builds.get(&job.uuid) {
            if existing.same_submission(job) {
                return Ok(Registration::AlreadyExists);
            }
            return Err(JudgeError::Conflict(format!(
                "build '{}' is already registered with different content",
                job.uuid
            )));
        }
        let mut stored = job.clone();
        stored.status = BuildStatus::Pending;
        stored.claimed_at = None;
        state.builds.insert(job.uuid.clone(), stored);
        Ok(Registration::Created)
    }

    async fn build(&self, uuid: &str) -> Result<Option<BuildJob>> {
        Ok(self.state.lock().await.builds.get(uuid).cloned())
    }

    async fn register_test_case(&self, case: &TestCase) -> Result<Registration> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.test_cases.get(&case.uuid) {
            if existing.same_content(case) {
                return Ok(Registration::AlreadyExists);
            }
            return Err(JudgeError::Conflict(format!(
                "test case '{}' is already registered with different content",
                case.uuid
            )));
        }
        state.test_cases.insert(case.uuid.clone(), case.clone());
        state
            .by_assignment
            .entry(case.assignment_uuid.clone())
            .or_default()
            .push(case.uuid.clone());
        Ok(Registration::Created)
    }

    async fn test_cases(&self, assignment_uuid: &str) -> Result<Vec<TestCase>> {
        let state = self.state.lock().await;
        let cases = state
            .by_assignment
            .get(assignment_uuid)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.test_cases.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(cases)
    }

    async fn claim(&self, uuid: &str, now_ms: i64) -> Result<ClaimOutcome> {
        let mut state = self.state.lock().await;
        let Some(job) = state.builds.get_mut(uuid) else {
            return Ok(ClaimOutcome::Missing);
        };
        if job.status != BuildStatus::Pending {
            return Ok(ClaimOutcome::AlreadyClaimed(job.status));
        }
        job.status = BuildStatus::Running;
        job.details = RunningPhase::Compiling.as_str().to_string();
        job.claimed_at = Some(now_ms);
        Ok(ClaimOutcome::Claimed)
    }

    async fn set_phase(&self, uuid: &str, phase: RunningPhase) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.builds.get_mut(uuid) {
            Some(job) if job.status == BuildStatus::Running => {
                job.details = phase.as_str().to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, uuid: &str, report: &BuildReport) -> Result<bool> {
        let mut state = self.state.lock().await;
        let job = state
            .builds
            .get_mut(uuid)
            .ok_or_else(|| JudgeError::NotFound(format!("build '{}' not found", uuid)))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.apply_report(report);
        job.claimed_at = None;
        Ok(true)
    }

    async fn heartbeat(&self, uuid: &str, now_ms: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.builds.get_mut(uuid) {
            Some(job) if job.status == BuildStatus::Running => {
                job.claimed_at = Some(now_ms);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_stale(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let StoreState {
            builds,
            awaiting_requeue,
            ..
        } = &mut *state;
        for job in builds.values_mut() {
            let stale = matches!(job.claimed_at, Some(at) if at <= cutoff_ms);
            if job.status == BuildStatus::Running && stale {
                job.status = BuildStatus::Pending;
                job.details.clear();
                job.claimed_at = None;
                awaiting_requeue.insert(job.uuid.clone());
            }
        }
        Ok(awaiting_requeue.iter().cloned().collect())
    }

    async fn confirm_requeued(&self, uuid: &str) -> Result<()> {
        self.state.lock().await.awaiting_requeue.remove(uuid);
        Ok(())
    }
}

struct QueueState {
    pending: VecDeque<String>,
    leased: Vec<(String, Instant)>,
    finished: Vec<BuildFinishedEvent>,
}

pub struct MemoryQueue {
    lease: Duration,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                leased: Vec::new(),
                finished: Vec::new(),
            }),
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn leased_len(&self) -> usize {
        self.state.lock().await.leased.len()
    }

    pub async fn finished_events(&self) -> Vec<BuildFinishedEvent> {
        self.state.lock().await.finished.clone()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, uuid: &str) -> Result<()> {
        self.state.lock().await.pending.push_back(uuid.to_string());
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let Some(uuid) = state.pending.pop_front() else {
            return Ok(None);
        };
        let deadline = Instant::now() + self.lease;
        state.leased.push((uuid.clone(), deadline));
        Ok(Some(Delivery { uuid }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.leased.iter().position(|(id, _)| *id == delivery.uuid) {
            state.leased.remove(pos);
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let (expired, live): (Vec<_>, Vec<_>) = state
            .leased
            .drain(..)
            .partition(|(_, deadline)| *deadline <= now);
        state.leased = live;
        let count = expired.len();
        for (uuid, _) in expired {
            state.pending.push_front(uuid);
        }
        Ok(count)
    }

    async fn notify_finished(&self, event: &BuildFinishedEvent) -> Result<()> {
        self.state.lock().await.finished.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn passed_report(total: u32) -> BuildReport {
        BuildReport {
            status: BuildStatus::Passed,
            score: 100,
            details: format!("all {} tests passed", total),
            build_log: String::new(),
            tests_log: String::new(),
            tests_passed: total,
            tests_total: total,
            exception: String::new(),
        }
    }

    #[tokio::test]
    async fn test_register_build_is_idempotent() {
        let store = MemoryStore::new();
        let job = BuildJob::new("b1", "a1", "c++", "src");

        assert_eq!(store.register_build(&job).await.unwrap(), Registration::Created);
        assert_eq!(
            store.register_build(&job).await.unwrap(),
            Registration::AlreadyExists
        );

        let changed = BuildJob::new("b1", "a1", "c++", "other src");
        assert!(matches!(
            store.register_build(&changed).await,
            Err(JudgeError::Conflict(_))
        ));
        assert_eq!(store.build("b1").await.unwrap().unwrap().source, "src");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        store
            .register_build(&BuildJob::new("b1", "a1", "c++", "src"))
            .await
            .unwrap();

        let (first, second) = tokio::join!(store.claim("b1", 1), store.claim("b1", 2));
        let outcomes = [first.unwrap(), second.unwrap()];
        let claimed = outcomes
            .iter()
            .filter(|o| **o == ClaimOutcome::Claimed)
            .count();
        assert_eq!(claimed, 1);
        assert!(outcomes.contains(&ClaimOutcome::AlreadyClaimed(BuildStatus::Running)));
        assert_eq!(store.claim("missing", 3).await.unwrap(), ClaimOutcome::Missing);
    }

    #[tokio::test]
    async fn test_finalize_does_not_overwrite_terminal_report() {
        let store = MemoryStore::new();
        store
            .register_build(&BuildJob::new("b1", "a1", "c++", "src"))
            .await
            .unwrap();
        store.claim("b1", 1).await.unwrap();

        assert!(store.finalize("b1", &passed_report(2)).await.unwrap());
        let late = BuildReport::internal_error("redelivered".into(), String::new());
        assert!(!store.finalize("b1", &late).await.unwrap());

        let job = store.build("b1").await.unwrap().unwrap();
        assert_eq!(job.status, BuildStatus::Passed);
        assert_eq!(job.tests_total, 2);
        assert_eq!(job.exception, "");
    }

    #[tokio::test]
    async fn test_phase_only_changes_running_jobs() {
        let store = MemoryStore::new();
        store
            .register_build(&BuildJob::new("b1", "a1", "c++", "src"))
            .await
            .unwrap();
        assert!(!store.set_phase("b1", RunningPhase::Testing).await.unwrap());

        store.claim("b1", 1).await.unwrap();
        assert_eq!(store.build("b1").await.unwrap().unwrap().details, "compiling");
        assert!(store.set_phase("b1", RunningPhase::Testing).await.unwrap());
        assert_eq!(store.build("b1").await.unwrap().unwrap().details, "testing");
    }

    #[tokio::test]
    async fn test_reset_stale_only_touches_old_claims() {
        let store = MemoryStore::new();
        for id in ["old", "fresh"] {
            store
                .register_build(&BuildJob::new(id, "a1", "c++", "src"))
                .await
                .unwrap();
        }
        store.claim("old", 100).await.unwrap();
        store.claim("fresh", 900).await.unwrap();

        let reset = store.reset_stale(500).await.unwrap();
        assert_eq!(reset, vec!["old".to_string()]);
        assert_eq!(store.build("old").await.unwrap().unwrap().status, BuildStatus::Pending);
        assert_eq!(store.build("fresh").await.unwrap().unwrap().status, BuildStatus::Running);
        assert_eq!(store.claim("old", 1000).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_reset_jobs_stay_listed_until_confirmed() {
        let store = MemoryStore::new();
        store
            .register_build(&BuildJob::new("b1", "a1", "c++", "src"))
            .await
            .unwrap();
        store.claim("b1", 100).await.unwrap();

        assert_eq!(store.reset_stale(500).await.unwrap(), vec!["b1".to_string()]);
        // Already pending, but not yet confirmed back on the queue
        assert_eq!(store.reset_stale(500).await.unwrap(), vec!["b1".to_string()]);

        store.confirm_requeued("b1").await.unwrap();
        assert!(store.reset_stale(500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_claim_fresh() {
        let store = MemoryStore::new();
        store
            .register_build(&BuildJob::new("b1", "a1", "c++", "src"))
            .await
            .unwrap();
        assert!(!store.heartbeat("b1", 900).await.unwrap());

        store.claim("b1", 100).await.unwrap();
        assert!(store.heartbeat("b1", 900).await.unwrap());
        assert!(store.reset_stale(500).await.unwrap().is_empty());
        assert_eq!(store.build("b1").await.unwrap().unwrap().claimed_at, Some(900));
    }

    #[tokio::test]
    async fn test_test_cases_keep_registration_order() {
        let store = MemoryStore::new();
        for (id, input) in [("t2", "2"), ("t1", "1"), ("t3", "3")] {
            store
                .register_test_case(&TestCase {
                    uuid: id.into(),
                    assignment_uuid: "a1".into(),
                    input: input.into(),
                    expected: input.into(),
                })
                .await
                .unwrap();
        }
        let ids: Vec<_> = store
            .test_cases("a1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.uuid)
            .collect();
        assert_eq!(ids, vec!["t2", "t1", "t3"]);
        assert!(store.test_cases("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_redelivers_after_lease_expiry() {
        let queue = MemoryQueue::new(Duration::from_millis(0));
        queue.publish("b1").await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.uuid, "b1");
        assert!(queue.receive().await.unwrap().is_none());

        assert_eq!(queue.requeue_expired().await.unwrap(), 1);
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(again.uuid, "b1");

        queue.ack(&again).await.unwrap();
        assert_eq!(queue.requeue_expired().await.unwrap(), 0);
        assert_eq!(queue.leased_len().await, 0);
    }

    #[tokio::test]
    async fn test_acked_delivery_is_not_redelivered() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        queue.publish("b1").await.unwrap();
        let delivery = queue.receive().await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.requeue_expired().await.unwrap(), 0);
        assert_eq!(queue.pending_len().await, 0);
    }
}
