/// Test Evaluator - Language-Agnostic Scoring Logic
///
/// **Core Responsibility:**
/// Compare raw execution outputs against expected outputs and turn the
/// counts into a terminal report.
///
/// **Critical Properties:**
/// - Knows nothing about toolchains, processes or containers
/// - Knows nothing about Redis
/// - Pure function: (test cases, execution outputs) → report
///
/// **Scoring Rules:**
/// - score = floor(100 * passed / total), or 100 when there are no tests
/// - passed iff every test passed, failed iff none did, partially_passed otherwise
///
/// **Normalization Rules:**
/// - Trailing whitespace on each line: ignored
/// - A single trailing newline: ignored
/// - `\r\n` line endings: ignored (`\r` is trailing whitespace)
/// - Leading whitespace, inner whitespace, blank lines, case: significant
use psjudge_common::types::{BuildReport, BuildStatus, TestCase};
use std::fmt;

/// Longest excerpt of expected/actual output quoted in the tests log
const DIFF_EXCERPT_CHARS: usize = 80;

/// Raw execution output for a single test case
/// Produced by a toolchain program, consumed by the evaluator
#[derive(Debug, Clone, Default)]
pub struct TestExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub execution_time_ms: u64,
    pub timed_out: bool,
    pub runtime_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Passed => "passed",
            Verdict::WrongAnswer => "wrong answer",
            Verdict::RuntimeError => "runtime error",
            Verdict::TimeLimitExceeded => "time limit exceeded",
        })
    }
}

/// Normalize output string for comparison
pub fn normalize_output(output: &str) -> String {
    output
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Timeouts take priority: a killed program also exits non-zero.
pub fn verdict(output: &TestExecutionOutput, test_case: &TestCase) -> Verdict {
    if output.timed_out {
        Verdict::TimeLimitExceeded
    } else if output.runtime_error {
        Verdict::RuntimeError
    } else if outputs_match(&output.stdout, &test_case.expected) {
        Verdict::Passed
    } else {
        Verdict::WrongAnswer
    }
}

pub fn score(passed: u32, total: u32) -> u32 {
    if total == 0 {
        return 100;
    }
    ((100 * u64::from(passed)) / u64::from(total)) as u32
}

pub fn final_status(passed: u32, total: u32) -> BuildStatus {
    if passed == total {
        BuildStatus::Passed
    } else if passed == 0 {
        BuildStatus::Failed
    } else {
        BuildStatus::PartiallyPassed
    }
}

fn excerpt(text: &str) -> String {
    let normalized = normalize_output(text);
    let mut chars = normalized.chars();
    let head: String = chars.by_ref().take(DIFF_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{:?}...", head)
    } else {
        format!("{:?}", head)
    }
}

/// One tests_log entry: input size, verdict, time, and a short diff when the
/// output did not match.
fn log_line(
    index: usize,
    test_case: &TestCase,
    output: &TestExecutionOutput,
    verdict: Verdict,
) -> String {
    let mut line = format!(
        "test #{}: {} (input {} bytes, {} ms)",
        index + 1,
        verdict,
        test_case.input.len(),
        output.execution_time_ms
    );
    match verdict {
        Verdict::WrongAnswer => {
            line.push_str(&format!(
                "\n  expected: {}\n  actual:   {}",
                excerpt(&test_case.expected),
                excerpt(&output.stdout)
            ));
        }
        Verdict::RuntimeError => {
            let code = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            line.push_str(&format!("\n  exit code: {}", code));
            if let Some(first) = output.stderr.lines().find(|l| !l.trim().is_empty()) {
                line.push_str(&format!("\n  stderr: {}", excerpt(first)));
            }
        }
        Verdict::Passed | Verdict::TimeLimitExceeded => {}
    }
    line
}

/// Evaluate all test outputs and produce the terminal report
///
/// `outputs` are positional: `outputs[i]` belongs to `test_cases[i]`. Cases
/// with no output count as runtime errors.
pub fn evaluate(
    test_cases: &[TestCase],
    outputs: &[TestExecutionOutput],
    build_log: String,
) -> BuildReport {
    let missing = TestExecutionOutput {
        runtime_error: true,
        stderr: "no output captured".to_string(),
        ..Default::default()
    };

    let mut passed = 0u32;
    let mut lines = Vec::with_capacity(test_cases.len());
    for (index, test_case) in test_cases.iter().enumerate() {
        let output = outputs.get(index).unwrap_or(&missing);
        let verdict = verdict(output, test_case);
        if verdict == Verdict::Passed {
            passed += 1;
        }
        lines.push(log_line(index, test_case, output, verdict));
    }

    let total = test_cases.len() as u32;
    let details = if total == 0 {
        "no test cases registered".to_string()
    } else if passed == total {
        format!("all {} tests passed", total)
    } else {
        format!("{} of {} tests passed", passed, total)
    };

    BuildReport {
        status: final_status(passed, total),
        score: score(passed, total),
        details,
        build_log,
        tests_log: lines.join("\n"),
        tests_passed: passed,
        tests_total: total,
        exception: String::new(),
    }
}
