// Test harness: runs every case of a test spec through the execution pool

use crate::engine::{ExecutionPool, SandboxError};
use crate::evaluator::{aggregate, evaluate_case, parse_test_spec, stdin_payload};
use std::time::Duration;
use tracing::{debug, info};
use vericode_common::types::TestSummary;

/// Fixed wall-clock bound for every test case
pub const TEST_CASE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Clone)]
pub struct TestRunner {
    pool: ExecutionPool,
}

impl TestRunner {
    pub fn new(pool: ExecutionPool) -> Self {
        Self { pool }
    }

    /// Run cases sequentially in spec order. Only a sandbox allocation
    /// failure aborts the run; every other failure is a failed case.
    #[tracing::instrument(skip_all, fields(backend = self.pool.backend()))]
    pub async fn run_tests(&self, source: &str, spec: &str) -> Result<TestSummary, SandboxError> {
        let cases = parse_test_spec(spec);
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            let stdin = stdin_payload(&case);
            let outcome = self.pool.execute(source, &stdin, TEST_CASE_TIMEOUT).await?;

            debug!(
                test = %case.name(),
                status = ?outcome.status(),
                execution_ms = outcome.duration_ms(),
                "Test case executed"
            );

            results.push(evaluate_case(case, outcome));
        }

        let summary = aggregate(results);
        info!(
            tests_passed = summary.tests_passed,
            total_tests = summary.total_tests,
            "Test run complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Sandbox;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vericode_common::types::{ExecutionOutcome, NO_INPUT_MARKER, TestResultRecord};

    /// Adds up integers on stdin, prints a greeting when there is none,
    /// and fails on a line reading `boom`
    struct AddingSandbox {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for AddingSandbox {
        fn name(&self) -> &'static str {
            "adding"
        }

        async fn execute(
            &self,
            _source: &str,
            stdin: &str,
            timeout: Duration,
        ) -> Result<ExecutionOutcome, SandboxError> {
            assert_eq!(timeout, TEST_CASE_TIMEOUT);
            self.calls.fetch_add(1, Ordering::SeqCst);

            if stdin.is_empty() {
                return Ok(ExecutionOutcome::Success {
                    stdout: "Hello\n".to_string(),
                    duration_ms: 1,
                });
            }
            if stdin.lines().any(|l| l == "boom") {
                return Ok(ExecutionOutcome::RuntimeError {
                    stderr: "ValueError: boom".to_string(),
                    exit_code: Some(1),
                    duration_ms: 1,
                });
            }
            let sum: i64 = stdin.lines().filter_map(|l| l.parse::<i64>().ok()).sum();
            Ok(ExecutionOutcome::Success {
                stdout: format!("{}\n", sum),
                duration_ms: 1,
            })
        }
    }

    struct BrokenSandbox;

    #[async_trait]
    impl Sandbox for BrokenSandbox {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn execute(
            &self,
            _source: &str,
            _stdin: &str,
            _timeout: Duration,
        ) -> Result<ExecutionOutcome, SandboxError> {
            Err(SandboxError::Allocation("no process slots".to_string()))
        }
    }

    fn adding_runner() -> (TestRunner, Arc<AddingSandbox>) {
        let sandbox = Arc::new(AddingSandbox {
            calls: AtomicUsize::new(0),
        });
        (TestRunner::new(ExecutionPool::new(sandbox.clone(), 2)), sandbox)
    }

    #[tokio::test]
    async fn test_sum_of_two_lines_passes() {
        let (runner, _) = adding_runner();
        let summary = runner.run_tests("", "5 3 -> 8").await.unwrap();

        assert_eq!(summary.tests_passed, 1);
        assert_eq!(summary.total_tests, 1);
        assert!(summary.results[0].passed);
    }

    #[tokio::test]
    async fn test_empty_input_sentinel_records_marker() {
        let (runner, _) = adding_runner();
        let summary = runner.run_tests("", "empty -> Hello").await.unwrap();

        assert!(summary.results[0].passed);
        let record = TestResultRecord::from(&summary.results[0]);
        assert_eq!(record.input, NO_INPUT_MARKER);
        assert_eq!(record.actual, "Hello");
    }

    #[tokio::test]
    async fn test_mixed_results_in_spec_order() {
        let (runner, sandbox) = adding_runner();
        let spec = "1 1 -> 2\n\n2 2 -> 5\nboom -> 0\n7";
        let summary = runner.run_tests("", spec).await.unwrap();

        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.tests_passed, 1);
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 4);

        let passed: Vec<bool> = summary.results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, false, false]);
        assert!(summary.results[1].message.contains("expected: 5, got: 4"));
        assert!(summary.results[2].message.starts_with("✗ Runtime error"));
        // Input-only line expects empty output
        assert!(summary.results[3].message.contains("got: 7"));
    }

    #[tokio::test]
    async fn test_blank_spec_has_no_cases() {
        let (runner, sandbox) = adding_runner();
        let summary = runner.run_tests("", "\n   \n").await.unwrap();

        assert_eq!(summary.total_tests, 0);
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allocation_failure_propagates() {
        let runner = TestRunner::new(ExecutionPool::new(Arc::new(BrokenSandbox), 1));
        let result = runner.run_tests("", "1 -> 1").await;

        assert!(matches!(result, Err(SandboxError::Allocation(_))));
    }
}
