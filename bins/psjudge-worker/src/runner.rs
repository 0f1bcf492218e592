// Test Runner - feeds each test case to the program in registration order.
// A failing or hanging test never stops the ones after it.

use psjudge_common::types::TestCase;
use tracing::{debug, warn};

use crate::evaluator::TestExecutionOutput;
use crate::toolchain::Program;

pub async fn run_tests(program: &dyn Program, test_cases: &[TestCase]) -> Vec<TestExecutionOutput> {
    let mut outputs = Vec::with_capacity(test_cases.len());

    for (idx, test_case) in test_cases.iter().enumerate() {
        let output = match program.run(&test_case.input).await {
            Ok(output) => output,
            Err(e) => {
                warn!(test = idx + 1, test_uuid = %test_case.uuid, error = %e, "Test execution error");
                TestExecutionOutput {
                    stderr: format!("Test execution error: {:#}", e),
                    runtime_error: true,
                    ..Default::default()
                }
            }
        };

        debug!(
            test = idx + 1,
            test_uuid = %test_case.uuid,
            execution_ms = output.execution_time_ms,
            timed_out = output.timed_out,
            runtime_error = output.runtime_error,
            "Test executed"
        );
        outputs.push(output);
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Echoes its input, fails on "boom", hangs (reports timeout) on "hang"
    struct ScriptedProgram;

    #[async_trait]
    impl Program for ScriptedProgram {
        async fn run(&self, input: &str) -> anyhow::Result<TestExecutionOutput> {
            match input {
                "boom" => anyhow::bail!("exec vanished"),
                "hang" => Ok(TestExecutionOutput {
                    timed_out: true,
                    ..Default::default()
                }),
                other => Ok(TestExecutionOutput {
                    stdout: other.to_string(),
                    exit_code: Some(0),
                    ..Default::default()
                }),
            }
        }
    }

    fn case(input: &str) -> TestCase {
        TestCase {
            uuid: format!("t-{}", input),
            assignment_uuid: "a".to_string(),
            input: input.to_string(),
            expected: input.to_string(),
        }
    }

    #[tokio::test]
    async fn test_every_case_runs_in_order() {
        let cases = vec![case("1"), case("hang"), case("boom"), case("4")];
        let outputs = run_tests(&ScriptedProgram, &cases).await;

        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs[0].stdout, "1");
        assert!(outputs[1].timed_out);
        assert!(outputs[2].runtime_error);
        assert!(outputs[2].stderr.contains("exec vanished"));
        assert_eq!(outputs[3].stdout, "4");
    }
}
