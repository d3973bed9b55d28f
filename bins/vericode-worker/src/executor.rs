/// Analysis Orchestrator - High-Level Composition
///
/// **Responsibility:**
/// Compose the stages for one submission into a single `AnalysisReport`.
///
/// **Architecture:**
/// 1. Lint the source (linter.rs)
/// 2. One baseline run with empty stdin (engine.rs)
/// 3. Run the test spec, when given (runner.rs + evaluator.rs)
/// 4. Score against the corpus snapshot (similarity.rs)
///
/// Every stage failure becomes a value in its report field. Only a failure
/// to allocate the execution environment aborts the analysis.

use crate::engine::{ExecutionPool, SandboxError};
use crate::linter::Linter;
use crate::runner::TestRunner;
use crate::similarity;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use vericode_common::types::{
    AnalysisReport, CorpusEntry, ExecutionOutcome, PlagiarismMatchRecord, PlagiarismVerdict,
    TestResultRecord, TestSummary, NO_RUNTIME_ERROR, OUTPUT_NOT_CHECKED,
};

/// Wall-clock bound of the baseline run
pub const BASELINE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to allocate execution environment: {0}")]
    ResourceAllocation(#[from] SandboxError),
}

#[derive(Clone)]
pub struct Analyzer {
    pool: ExecutionPool,
    runner: TestRunner,
    linter: Linter,
}

impl Analyzer {
    pub fn new(pool: ExecutionPool, linter: Linter) -> Self {
        Self {
            runner: TestRunner::new(pool.clone()),
            pool,
            linter,
        }
    }

    /// Analyze one submission.
    ///
    /// `expected_output` is part of the caller contract but is never
    /// compared; the report says so in `outputCheck`.
    #[tracing::instrument(
        skip_all,
        fields(source_size = source.len(), corpus_size = corpus.len())
    )]
    pub async fn analyze(
        &self,
        source: &str,
        expected_output: Option<&str>,
        test_spec: Option<&str>,
        corpus: Vec<CorpusEntry>,
    ) -> Result<AnalysisReport, AnalysisError> {
        let style = self.linter.lint(source).await.render();

        let baseline = self.pool.execute(source, "", BASELINE_TIMEOUT).await?;
        if let ExecutionOutcome::Timeout { .. } = baseline {
            warn!("Baseline run timed out");
        }

        if expected_output.is_some() {
            debug!("Expected output supplied; not compared");
        }

        let summary = match test_spec {
            Some(spec) => self.runner.run_tests(source, spec).await?,
            None => TestSummary::default(),
        };

        let verdict = self.plagiarism(source, corpus).await;

        info!(
            baseline = ?baseline.status(),
            performance_ms = baseline.duration_ms(),
            tests_passed = summary.tests_passed,
            total_tests = summary.total_tests,
            plagiarism_flagged = verdict.flagged,
            "Analysis complete"
        );

        Ok(build_report(style, &baseline, &summary, &verdict))
    }

    /// Similarity is CPU-bound, so it runs off the async workers. The scan
    /// is bounded by its own budget.
    async fn plagiarism(&self, source: &str, corpus: Vec<CorpusEntry>) -> PlagiarismVerdict {
        let source = source.to_string();
        match tokio::task::spawn_blocking(move || similarity::detect(&source, &corpus)).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "Similarity scan failed, reporting no matches");
                PlagiarismVerdict::default()
            }
        }
    }
}

fn errors_field(baseline: &ExecutionOutcome) -> String {
    match baseline {
        ExecutionOutcome::Success { .. } => NO_RUNTIME_ERROR.to_string(),
        ExecutionOutcome::RuntimeError {
            stderr, exit_code, ..
        } => {
            let stderr = stderr.trim();
            if stderr.is_empty() {
                match exit_code {
                    Some(code) => format!("Process exited with code {}", code),
                    None => "Process terminated abnormally".to_string(),
                }
            } else {
                stderr.to_string()
            }
        }
        ExecutionOutcome::Timeout { .. } => format!(
            "Execution timed out after {} ms",
            BASELINE_TIMEOUT.as_millis()
        ),
    }
}

fn build_report(
    style: String,
    baseline: &ExecutionOutcome,
    summary: &TestSummary,
    verdict: &PlagiarismVerdict,
) -> AnalysisReport {
    AnalysisReport {
        style,
        errors: errors_field(baseline),
        performance_ms: baseline.duration_ms(),
        output: baseline.stdout().unwrap_or_default().to_string(),
        output_check: OUTPUT_NOT_CHECKED.to_string(),
        tests_passed: summary.tests_passed,
        total_tests: summary.total_tests,
        test_results: summary.results.iter().map(TestResultRecord::from).collect(),
        plagiarism_flagged: verdict.flagged,
        plagiarism_max_percent: vericode_common::types::to_percent(verdict.max_score),
        plagiarism_matches: verdict
            .matches
            .iter()
            .map(PlagiarismMatchRecord::from)
            .collect(),
    }
}
