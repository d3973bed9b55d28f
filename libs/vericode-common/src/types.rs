use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recorded as the input of a test case that feeds nothing on stdin
pub const NO_INPUT_MARKER: &str = "(no input)";

/// Style field value when the linter reports nothing
pub const NO_STYLE_ISSUES: &str = "No issues found";

/// Errors field value when the baseline run exits cleanly
pub const NO_RUNTIME_ERROR: &str = "None";

/// The expected output of an assignment is accepted but never compared
pub const OUTPUT_NOT_CHECKED: &str = "Not checked";

/// A submission queued for analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub assignment_id: String,
    pub author_id: String,
    pub source_code: String,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub tests: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// One peer submission in the plagiarism comparison pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub author_id: String,
    pub source: String,
}

impl CorpusEntry {
    pub fn new(author_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            author_id: author_id.into(),
            source: source.into(),
        }
    }
}

/// One non-blank line of a test spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Zero-based position in the test spec
    pub index: usize,
    /// Input side as written in the spec, empty when the case feeds no input
    pub stdin: String,
    pub expected_output: String,
    pub raw_spec_line: String,
}

impl TestCase {
    pub fn name(&self) -> String {
        format!("Test {}", self.index + 1)
    }

    pub fn display_input(&self) -> &str {
        if self.stdin.is_empty() {
            NO_INPUT_MARKER
        } else {
            &self.stdin
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    RuntimeError,
    Timeout,
}

/// Result of one sandboxed run.
///
/// Only the stream that matters for the status is kept: stdout for a clean
/// exit, stderr for a non-zero exit, nothing for a killed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        duration_ms: u64,
    },
    RuntimeError {
        stderr: String,
        exit_code: Option<i64>,
        duration_ms: u64,
    },
    Timeout {
        duration_ms: u64,
    },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Success { .. } => ExecutionStatus::Success,
            Self::RuntimeError { .. } => ExecutionStatus::RuntimeError,
            Self::Timeout { .. } => ExecutionStatus::Timeout,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Success { duration_ms, .. }
            | Self::RuntimeError { duration_ms, .. }
            | Self::Timeout { duration_ms } => *duration_ms,
        }
    }

    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::Success { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::RuntimeError { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseResult {
    pub case: TestCase,
    pub outcome: ExecutionOutcome,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSummary {
    pub tests_passed: usize,
    pub total_tests: usize,
    pub results: Vec<TestCaseResult>,
}

/// A corpus entry whose similarity exceeded the plagiarism threshold
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    pub author_id: String,
    /// Always within [0, 1]
    pub score: f64,
}

impl SimilarityMatch {
    pub fn percent(&self) -> f64 {
        to_percent(self.score)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlagiarismVerdict {
    pub flagged: bool,
    /// Highest matching score, 0 when nothing matched
    pub max_score: f64,
    pub matches: Vec<SimilarityMatch>,
}

/// Scale a [0, 1] score to a percentage rounded to one decimal place
pub fn to_percent(score: f64) -> f64 {
    (score * 1000.0).round() / 10.0
}

/// Per-case entry of the wire report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultRecord {
    pub name: String,
    pub passed: bool,
    pub input: String,
    pub expected: String,
    pub actual: String,
    pub message: String,
}

impl From<&TestCaseResult> for TestResultRecord {
    fn from(result: &TestCaseResult) -> Self {
        Self {
            name: result.case.name(),
            passed: result.passed,
            input: result.case.display_input().to_string(),
            expected: result.case.expected_output.clone(),
            actual: result
                .outcome
                .stdout()
                .map(|out| out.trim().to_string())
                .unwrap_or_default(),
            message: result.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlagiarismMatchRecord {
    pub author: String,
    pub similarity_percent: f64,
}

impl From<&SimilarityMatch> for PlagiarismMatchRecord {
    fn from(m: &SimilarityMatch) -> Self {
        Self {
            author: m.author_id.clone(),
            similarity_percent: m.percent(),
        }
    }
}

/// Report handed back to the caller; field names are part of the contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub style: String,
    pub errors: String,
    pub performance_ms: u64,
    pub output: String,
    pub output_check: String,
    pub tests_passed: usize,
    pub total_tests: usize,
    pub test_results: Vec<TestResultRecord>,
    pub plagiarism_flagged: bool,
    pub plagiarism_max_percent: f64,
    pub plagiarism_matches: Vec<PlagiarismMatchRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Completed,
    Failed,
}

/// What the persistence sink stores for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub job_id: Uuid,
    pub assignment_id: String,
    pub author_id: String,
    pub status: JobStatus,
    pub report: Option<AnalysisReport>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn completed(job: &AnalysisJob, report: AnalysisReport) -> Self {
        Self {
            job_id: job.id,
            assignment_id: job.assignment_id.clone(),
            author_id: job.author_id.clone(),
            status: JobStatus::Completed,
            report: Some(report),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(job: &AnalysisJob, error: impl Into<String>) -> Self {
        Self {
            job_id: job.id,
            assignment_id: job.assignment_id.clone(),
            author_id: job.author_id.clone(),
            status: JobStatus::Failed,
            report: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }
}
