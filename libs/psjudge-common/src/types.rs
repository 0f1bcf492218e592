use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::JudgeError;

/// Lifecycle of a build job.
///
/// `pending → running → {passed | partially_passed | failed | error}`.
/// Every state after `running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Passed,
    PartiallyPassed,
    Failed,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Passed => "passed",
            BuildStatus::PartiallyPassed => "partially_passed",
            BuildStatus::Failed => "failed",
            BuildStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = JudgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "running" => Ok(BuildStatus::Running),
            "passed" => Ok(BuildStatus::Passed),
            "partially_passed" => Ok(BuildStatus::PartiallyPassed),
            "failed" => Ok(BuildStatus::Failed),
            "error" => Ok(BuildStatus::Error),
            other => Err(JudgeError::Internal(format!("unknown build status '{}'", other))),
        }
    }
}

/// Progress marker written to `details` while a job is `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningPhase {
    Compiling,
    Testing,
}

impl RunningPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunningPhase::Compiling => "compiling",
            RunningPhase::Testing => "testing",
        }
    }
}

/// Input/expected-output pair belonging to one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub uuid: String,
    pub assignment_uuid: String,
    pub input: String,
    pub expected: String,
}

impl TestCase {
    pub fn same_content(&self, other: &TestCase) -> bool {
        self.assignment_uuid == other.assignment_uuid
            && self.input == other.input
            && self.expected == other.expected
    }
}

/// One submission's compile-and-judge unit of work, keyed by its
/// client-supplied uuid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub uuid: String,
    pub assignment_uuid: String,
    pub language: String,
    pub source: String,
    pub status: BuildStatus,
    pub score: u32,
    pub details: String,
    pub build_log: String,
    pub tests_log: String,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub exception: String,
    /// Unix time in milliseconds.
    pub created_at: i64,
    /// Set when the job is claimed by a worker, cleared when reset.
    pub claimed_at: Option<i64>,
}

impl BuildJob {
    pub fn new(uuid: &str, assignment_uuid: &str, language: &str, source: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            assignment_uuid: assignment_uuid.to_string(),
            language: language.to_string(),
            source: source.to_string(),
            status: BuildStatus::Pending,
            score: 0,
            details: String::new(),
            build_log: String::new(),
            tests_log: String::new(),
            tests_passed: 0,
            tests_total: 0,
            exception: String::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            claimed_at: None,
        }
    }

    /// Whether two registrations describe the same submission.
    pub fn same_submission(&self, other: &BuildJob) -> bool {
        self.assignment_uuid == other.assignment_uuid
            && self.language == other.language
            && self.source == other.source
    }

    pub fn apply_report(&mut self, report: &BuildReport) {
        self.status = report.status;
        self.score = report.score;
        self.details = report.details.clone();
        self.build_log = report.build_log.clone();
        self.tests_log = report.tests_log.clone();
        self.tests_passed = report.tests_passed;
        self.tests_total = report.tests_total;
        self.exception = report.exception.clone();
    }
}

/// Terminal outcome of a job, written in one atomic update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub status: BuildStatus,
    pub score: u32,
    pub details: String,
    pub build_log: String,
    pub tests_log: String,
    pub tests_passed: u32,
    pub tests_total: u32,
    pub exception: String,
}

impl BuildReport {
    pub fn unsupported_language(language: &str) -> Self {
        Self {
            status: BuildStatus::Failed,
            score: 0,
            details: format!("unsupported language '{}'", language),
            build_log: String::new(),
            tests_log: String::new(),
            tests_passed: 0,
            tests_total: 0,
            exception: "unsupported language".to_string(),
        }
    }

    pub fn compilation_failed(build_log: String, timed_out: bool) -> Self {
        let details = if timed_out {
            "compilation timed out"
        } else {
            "compilation failed"
        };
        Self {
            status: BuildStatus::Failed,
            score: 0,
            details: details.to_string(),
            build_log,
            tests_log: String::new(),
            tests_passed: 0,
            tests_total: 0,
            exception: String::new(),
        }
    }

    pub fn internal_error(exception: String, build_log: String) -> Self {
        Self {
            status: BuildStatus::Error,
            score: 0,
            details: "internal error".to_string(),
            build_log,
            tests_log: String::new(),
            tests_passed: 0,
            tests_total: 0,
            exception,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Running,
            BuildStatus::Passed,
            BuildStatus::PartiallyPassed,
            BuildStatus::Failed,
            BuildStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("succeed".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Passed.is_terminal());
        assert!(BuildStatus::PartiallyPassed.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Error.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&BuildStatus::PartiallyPassed).unwrap();
        assert_eq!(json, "\"partially_passed\"");
    }

    #[test]
    fn test_new_job_is_pending_with_empty_report() {
        let job = BuildJob::new("b1", "a1", "c++", "int main() {}");
        assert_eq!(job.status, BuildStatus::Pending);
        assert_eq!(job.score, 0);
        assert_eq!(job.details, "");
        assert_eq!(job.tests_total, 0);
        assert!(job.claimed_at.is_none());
    }

    #[test]
    fn test_same_submission_ignores_state() {
        let a = BuildJob::new("b1", "a1", "c++", "src");
        let mut b = BuildJob::new("b1", "a1", "c++", "src");
        b.status = BuildStatus::Passed;
        assert!(a.same_submission(&b));

        let c = BuildJob::new("b1", "a1", "pascal", "src");
        assert!(!a.same_submission(&c));
    }

    #[test]
    fn test_apply_report_copies_all_fields() {
        let mut job = BuildJob::new("b1", "a1", "c++", "src");
        let report = BuildReport::compilation_failed("error: expected ';'".into(), false);
        job.apply_report(&report);
        assert_eq!(job.status, BuildStatus::Failed);
        assert_eq!(job.build_log, "error: expected ';'");
        assert_eq!(job.details, "compilation failed");
        assert_eq!(job.tests_total, 0);
    }
}
