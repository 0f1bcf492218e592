/// Build Executor - High-Level Orchestration of one claimed job
///
/// **Architecture:**
/// 1. Resolve the toolchain for the job's language (toolchain.rs)
/// 2. Compile once in the slot's work directory
/// 3. Run every test case against the program (runner.rs)
/// 4. Score the outputs (evaluator.rs)
/// 5. Finalize through the status publisher (publisher.rs)
///
/// Judged outcomes come back as a `BuildReport`; only a failed finalize is
/// an `Err`, which leaves the delivery unacknowledged. While a job is being
/// judged its claim time is refreshed periodically, so the reaper only resets
/// jobs whose worker has gone away.
use psjudge_common::store::JobStore;
use psjudge_common::types::{BuildJob, BuildReport, RunningPhase};
use psjudge_common::JudgeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::evaluator;
use crate::metrics::PIPELINE_DURATION;
use crate::publisher::StatusPublisher;
use crate::runner;
use crate::toolchain::ToolchainRegistry;

pub struct BuildExecutor {
    store: Arc<dyn JobStore>,
    toolchains: ToolchainRegistry,
    publisher: StatusPublisher,
    work_dir: PathBuf,
    heartbeat_interval: Duration,
}

/// Stops the heartbeat when the job is done, also on unwind.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl BuildExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        toolchains: ToolchainRegistry,
        publisher: StatusPublisher,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            toolchains,
            publisher,
            work_dir,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn slot_dir(&self, slot: usize) -> PathBuf {
        self.work_dir.join(format!("builder_{}", slot))
    }

    /// Judge a claimed job and write its terminal report.
    #[tracing::instrument(skip(self, job), fields(uuid = %job.uuid, language = %job.language))]
    pub async fn execute(&self, job: &BuildJob, slot: usize) -> Result<bool, JudgeError> {
        let start = Instant::now();
        let heartbeat = self.spawn_heartbeat(&job.uuid);
        let report = self.judge(job, &self.slot_dir(slot)).await;
        drop(heartbeat);
        PIPELINE_DURATION.observe(start.elapsed().as_secs_f64());

        if !report.exception.is_empty() {
            warn!(exception = %report.exception, status = %report.status, "Build ended abnormally");
        }
        self.publisher.finalize(&job.uuid, &report).await
    }

    fn spawn_heartbeat(&self, uuid: &str) -> HeartbeatGuard {
        let publisher = self.publisher.clone();
        let uuid = uuid.to_string();
        let period = self.heartbeat_interval;
        HeartbeatGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the claim itself is fresh
            ticker.tick().await;
            loop {
                ticker.tick().await;
                publisher.heartbeat(&uuid).await;
            }
        }))
    }

    /// Compile and test, turning every failure into a report.
    pub async fn judge(&self, job: &BuildJob, workdir: &Path) -> BuildReport {
        let Some(toolchain) = self.toolchains.get(&job.language) else {
            warn!("Unsupported language");
            return BuildReport::unsupported_language(&job.language);
        };

        let test_cases = match self.store.test_cases(&job.assignment_uuid).await {
            Ok(cases) => cases,
            Err(e) => {
                error!(error = %e, "Failed to load test cases");
                return BuildReport::internal_error(format!("failed to load test cases: {}", e), String::new());
            }
        };

        if let Err(e) = prepare_workdir(workdir).await {
            error!(error = %e, workdir = %workdir.display(), "Failed to prepare work directory");
            return BuildReport::internal_error(format!("failed to prepare work directory: {}", e), String::new());
        }

        let compiled = match toolchain.compile(&job.source, workdir).await {
            Ok(compiled) => compiled,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Toolchain failure");
                return BuildReport::internal_error(format!("toolchain failure: {:#}", e), String::new());
            }
        };

        let program = match compiled.program {
            Some(program) if compiled.success => program,
            _ => {
                info!(timed_out = compiled.timed_out, "Compilation failed");
                return BuildReport::compilation_failed(compiled.log, compiled.timed_out);
            }
        };

        self.publisher.phase(&job.uuid, RunningPhase::Testing).await;
        let outputs = runner::run_tests(program.as_ref(), &test_cases).await;
        drop(program);

        evaluator::evaluate(&test_cases, &outputs, compiled.log)
    }
}

/// Fresh, empty directory for the next job of this slot.
async fn prepare_workdir(workdir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(workdir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    tokio::fs::create_dir_all(workdir).await
}
