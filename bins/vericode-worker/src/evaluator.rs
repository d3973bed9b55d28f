/// Test Evaluator - Test Spec Parsing and Judging
///
/// **Core Responsibility:**
/// Turn a test spec into ordered test cases and judge execution outcomes
/// against them.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or processes
/// - Knows nothing about Redis
/// - Pure functions: (spec text) → cases, (case, outcome) → result
///
/// **Test Spec Format:**
/// - One case per non-blank line, order preserved
/// - `input -> expected` splits on the first `->`, both sides trimmed
/// - An input of `empty` (any case) feeds nothing on stdin
/// - A line without `->` is input-only and expects empty output. Such a case
///   passes only if the program prints nothing; kept literally on purpose.
///
/// **Normalization Rules:**
/// - Trim leading and trailing whitespace on both sides: YES
/// - Case sensitivity: YES (exact match required)
/// - Numeric tolerance / partial credit: NO

use vericode_common::types::{ExecutionOutcome, TestCase, TestCaseResult, TestSummary};

pub const SEPARATOR: &str = "->";

/// Input values meaning "no stdin", compared case-insensitively.
/// `пусто` is accepted for specs written against the legacy grader.
pub const EMPTY_INPUT_SENTINELS: &[&str] = &["empty", "пусто"];

fn is_empty_sentinel(input: &str) -> bool {
    let lowered = input.to_lowercase();
    EMPTY_INPUT_SENTINELS.iter().any(|s| *s == lowered)
}

/// Parse a test spec into cases, one per non-blank line
pub fn parse_test_spec(spec: &str) -> Vec<TestCase> {
    spec.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            let (stdin, expected_output) = match line.split_once(SEPARATOR) {
                Some((input, expected)) => {
                    let input = input.trim();
                    let input = if is_empty_sentinel(input) { "" } else { input };
                    (input.to_string(), expected.trim().to_string())
                }
                None => (line.to_string(), String::new()),
            };

            TestCase {
                index,
                stdin,
                expected_output,
                raw_spec_line: line.to_string(),
            }
        })
        .collect()
}

/// Bytes fed to the program: every space becomes a line break so
/// `5 3` arrives as two input lines
pub fn stdin_payload(case: &TestCase) -> String {
    if case.stdin.is_empty() {
        return String::new();
    }
    let mut payload = case.stdin.replace(' ', "\n");
    payload.push('\n');
    payload
}

fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Judge one execution outcome against its case.
///
/// Runtime errors and timeouts never pass; a clean exit passes on an exact
/// match after trimming.
pub fn evaluate_case(case: TestCase, outcome: ExecutionOutcome) -> TestCaseResult {
    let (passed, message) = match &outcome {
        ExecutionOutcome::Success { stdout, .. } => {
            let actual = normalize_output(stdout);
            let expected = normalize_output(&case.expected_output);
            if actual == expected {
                (true, "✓ Correct".to_string())
            } else {
                (
                    false,
                    format!("✗ Wrong answer (expected: {}, got: {})", expected, actual),
                )
            }
        }
        ExecutionOutcome::RuntimeError { stderr, .. } => {
            (false, format!("✗ Runtime error: {}", stderr.trim()))
        }
        ExecutionOutcome::Timeout { .. } => (false, "✗ Time limit exceeded".to_string()),
    };

    TestCaseResult {
        case,
        outcome,
        passed,
        message,
    }
}

/// Count passes over results already in spec order
pub fn aggregate(results: Vec<TestCaseResult>) -> TestSummary {
    let tests_passed = results.iter().filter(|r| r.passed).count();
    TestSummary {
        tests_passed,
        total_tests: results.len(),
        results,
    }
}
