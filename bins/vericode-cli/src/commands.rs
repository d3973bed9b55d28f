// CLI commands for submitting code and reading analysis records
use anyhow::{bail, Context, Result};
use redis::aio::ConnectionManager;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use uuid::Uuid;
use vericode_common::config::Config;
use vericode_common::redis as store;
use vericode_common::types::{AnalysisJob, AnalysisRecord, AnalysisReport, JobStatus};

async fn connect() -> Result<ConnectionManager> {
    let redis_url = Config::from_env().redis_url;
    let client = redis::Client::open(redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Assemble a job from files on disk
pub fn build_job(
    assignment: &str,
    author: &str,
    source_path: &Path,
    tests_path: Option<&Path>,
    expected_path: Option<&Path>,
) -> Result<AnalysisJob> {
    if assignment.trim().is_empty() || author.trim().is_empty() {
        bail!("Assignment and author cannot be empty");
    }

    let source_code = read_file(source_path)?;

    let tests = tests_path.map(read_file).transpose()?;
    let expected_output = expected_path.map(read_file).transpose()?;

    Ok(AnalysisJob {
        id: Uuid::new_v4(),
        assignment_id: assignment.to_string(),
        author_id: author.to_string(),
        source_code,
        expected_output,
        tests,
        submitted_at: chrono::Utc::now(),
    })
}

pub async fn submit(
    assignment: &str,
    author: &str,
    source_path: &Path,
    tests_path: Option<&Path>,
    expected_path: Option<&Path>,
) -> Result<()> {
    let job = build_job(assignment, author, source_path, tests_path, expected_path)?;
    let mut conn = connect().await?;

    store::push_job(&mut conn, &job)
        .await
        .context("Failed to queue job")?;

    println!("📨 Queued analysis job: {}", job.id);
    println!("\n📋 Next steps:");
    println!("  1. Check the report: vericode-cli report {}", job.id);

    Ok(())
}

pub async fn show_report(job_id: &str, json: bool) -> Result<()> {
    let job_id = Uuid::parse_str(job_id).with_context(|| format!("Invalid job id '{}'", job_id))?;
    let mut conn = connect().await?;

    let Some(record) = store::get_record(&mut conn, &job_id)
        .await
        .context("Failed to read record")?
    else {
        println!("⏳ No record for {} yet (queued, running or expired)", job_id);
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print!("{}", render_record(&record));
    }

    Ok(())
}

pub async fn list_corpus(assignment: &str) -> Result<()> {
    let mut conn = connect().await?;
    let corpus = store::load_corpus(&mut conn, assignment, None)
        .await
        .context("Failed to load corpus")?;

    if corpus.is_empty() {
        println!("No submissions committed for '{}'.", assignment);
        return Ok(());
    }

    println!("📋 Submissions for {}:\n", assignment);
    println!("{:<24} {:>8} {:>10}", "AUTHOR", "LINES", "BYTES");
    println!("{}", "─".repeat(44));
    for entry in &corpus {
        println!(
            "{:<24} {:>8} {:>10}",
            entry.author_id,
            entry.source.lines().count(),
            entry.source.len()
        );
    }
    println!("\n✅ Total: {} submission(s)", corpus.len());

    Ok(())
}

/// Human-readable rendering of a stored record
pub fn render_record(record: &AnalysisRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Job {} ({} / {})",
        record.job_id, record.assignment_id, record.author_id
    );

    match (record.status, &record.report) {
        (JobStatus::Completed, Some(report)) => render_report(&mut out, report),
        _ => {
            let _ = writeln!(
                out,
                "❌ Failed: {}",
                record.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    out
}

fn render_report(out: &mut String, report: &AnalysisReport) {
    let _ = writeln!(out, "\nStyle:\n{}", report.style);
    let _ = writeln!(out, "\nErrors: {}", report.errors);
    let _ = writeln!(out, "Performance: {} ms", report.performance_ms);
    let _ = writeln!(out, "Output check: {}", report.output_check);

    let _ = writeln!(
        out,
        "\nTests: {}/{} passed",
        report.tests_passed, report.total_tests
    );
    for test in &report.test_results {
        let _ = writeln!(out, "  {} [{}]: {}", test.name, test.input, test.message);
    }

    if report.plagiarism_flagged {
        let _ = writeln!(
            out,
            "\n⚠️  Possible plagiarism (max {:.1}%):",
            report.plagiarism_max_percent
        );
        for m in &report.plagiarism_matches {
            let _ = writeln!(out, "  {:<24} {:.1}%", m.author, m.similarity_percent);
        }
    } else {
        let _ = writeln!(
            out,
            "\n✅ No plagiarism detected (max {:.1}%)",
            report.plagiarism_max_percent
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vericode_common::types::{PlagiarismMatchRecord, TestResultRecord};

    fn job() -> AnalysisJob {
        AnalysisJob {
            id: Uuid::new_v4(),
            assignment_id: "hw1".to_string(),
            author_id: "bob".to_string(),
            source_code: "print(1)\n".to_string(),
            expected_output: None,
            tests: None,
            submitted_at: chrono::Utc::now(),
        }
    }

    fn report() -> AnalysisReport {
        AnalysisReport {
            style: "No issues found".to_string(),
            errors: "None".to_string(),
            performance_ms: 42,
            output: "1\n".to_string(),
            output_check: "Not checked".to_string(),
            tests_passed: 1,
            total_tests: 2,
            test_results: vec![
                TestResultRecord {
                    name: "Test 1".to_string(),
                    passed: true,
                    input: "5 3".to_string(),
                    expected: "8".to_string(),
                    actual: "8".to_string(),
                    message: "✓ Correct".to_string(),
                },
                TestResultRecord {
                    name: "Test 2".to_string(),
                    passed: false,
                    input: "(no input)".to_string(),
                    expected: "Hello".to_string(),
                    actual: "".to_string(),
                    message: "✗ Time limit exceeded".to_string(),
                },
            ],
            plagiarism_flagged: true,
            plagiarism_max_percent: 93.4,
            plagiarism_matches: vec![PlagiarismMatchRecord {
                author: "alice".to_string(),
                similarity_percent: 93.4,
            }],
        }
    }

    #[test]
    fn test_build_job_reads_files() {
        let dir = std::env::temp_dir().join(format!("vericode-cli-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let source = dir.join("main.py");
        let tests = dir.join("tests.txt");
        fs::write(&source, "print(input())\n").unwrap();
        let expected = dir.join("expected.txt");
        fs::write(&tests, "hi -> hi\n").unwrap();
        fs::write(&expected, "hi\n").unwrap();

        let job = build_job("hw1", "alice", &source, Some(&tests), Some(&expected)).unwrap();
        assert_eq!(job.assignment_id, "hw1");
        assert_eq!(job.source_code, "print(input())\n");
        assert_eq!(job.tests.as_deref(), Some("hi -> hi\n"));
        assert_eq!(job.expected_output.as_deref(), Some("hi\n"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_build_job_rejects_missing_file() {
        let missing = Path::new("/nonexistent/vericode/main.py");
        assert!(build_job("hw1", "alice", missing, None, None).is_err());
    }

    #[test]
    fn test_build_job_rejects_blank_author() {
        let missing = Path::new("main.py");
        assert!(build_job("hw1", "  ", missing, None, None).is_err());
    }

    #[test]
    fn test_render_completed_record() {
        let text = render_record(&AnalysisRecord::completed(&job(), report()));

        assert!(text.contains("(hw1 / bob)"));
        assert!(text.contains("Tests: 1/2 passed"));
        assert!(text.contains("Test 2 [(no input)]: ✗ Time limit exceeded"));
        assert!(text.contains("Possible plagiarism (max 93.4%)"));
        assert!(text.contains("alice"));
    }

    #[test]
    fn test_render_failed_record() {
        let text = render_record(&AnalysisRecord::failed(&job(), "corpus unavailable"));
        assert!(text.contains("❌ Failed: corpus unavailable"));
        assert!(!text.contains("Tests:"));
    }
}
