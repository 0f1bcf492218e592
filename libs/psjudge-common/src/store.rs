/// Job Store - durable table of build jobs and test cases
///
/// The store is the single serialization point of the pipeline: the
/// `status` field of a build is used as a compare-and-set lock.
/// - `claim` moves `pending → running` only if the job is still `pending`
/// - `finalize` writes a report only if the job is not yet terminal
///
/// Implementations must make both operations atomic.
use async_trait::async_trait;

use crate::error::Result;
use crate::types::{BuildJob, BuildReport, BuildStatus, RunningPhase, TestCase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// An identical record was already stored; nothing changed.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another delivery got there first, or the job is already finished.
    AlreadyClaimed(BuildStatus),
    Missing,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `pending` build. Re-registering the same submission is a
    /// no-op; the same uuid with different content is a conflict.
    async fn register_build(&self, job: &BuildJob) -> Result<Registration>;

    async fn build(&self, uuid: &str) -> Result<Option<BuildJob>>;

    async fn register_test_case(&self, case: &TestCase) -> Result<Registration>;

    /// Test cases of an assignment in registration order.
    async fn test_cases(&self, assignment_uuid: &str) -> Result<Vec<TestCase>>;

    async fn claim(&self, uuid: &str, now_ms: i64) -> Result<ClaimOutcome>;

    /// Update the progress marker of a running job. Returns false if the job
    /// is no longer running.
    async fn set_phase(&self, uuid: &str, phase: RunningPhase) -> Result<bool>;

    /// Returns false when the job was already terminal and nothing was
    /// written.
    async fn finalize(&self, uuid: &str, report: &BuildReport) -> Result<bool>;

    /// Refresh the claim time of a running job so it is not taken for
    /// stale. Returns false if the job is no longer running.
    async fn heartbeat(&self, uuid: &str, now_ms: i64) -> Result<bool>;

    /// Put jobs claimed at or before `cutoff_ms` back to `pending` and record
    /// them as awaiting requeue, in the same atomic step. Returns every uuid
    /// still awaiting requeue, including ones reset by earlier calls.
    async fn reset_stale(&self, cutoff_ms: i64) -> Result<Vec<String>>;

    /// Drop `uuid` from the awaiting-requeue set once it is back on the queue.
    async fn confirm_requeued(&self, uuid: &str) -> Result<()>;
}
