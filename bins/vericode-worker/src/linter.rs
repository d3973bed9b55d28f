// Style analyzer: runs an external linter over the submitted source.
// Tool failures never abort an analysis; they become a diagnostic string.

use crate::config::LinterSettings;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use vericode_common::types::NO_STYLE_ISSUES;

const SCRIPT_NAME: &str = "main.py";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintOutcome {
    Clean,
    Issues(String),
    Unavailable(String),
}

impl LintOutcome {
    /// Text stored in the report's style field
    pub fn render(&self) -> String {
        match self {
            Self::Clean => NO_STYLE_ISSUES.to_string(),
            Self::Issues(text) => text.clone(),
            Self::Unavailable(reason) => format!("Linter unavailable: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Linter {
    settings: LinterSettings,
}

impl Linter {
    pub fn new(settings: LinterSettings) -> Self {
        Self { settings }
    }

    /// Lint `source` as `main.py` in a scratch directory so reported paths
    /// are stable across runs
    #[tracing::instrument(skip_all, fields(linter = %self.settings.command))]
    pub async fn lint(&self, source: &str) -> LintOutcome {
        let workdir = match tempfile::Builder::new().prefix("vericode-lint-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return LintOutcome::Unavailable(format!("failed to create work directory: {}", e))
            }
        };
        if let Err(e) = tokio::fs::write(workdir.path().join(SCRIPT_NAME), source).await {
            return LintOutcome::Unavailable(format!("failed to write source: {}", e));
        }

        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&self.settings.args)
            .arg(SCRIPT_NAME)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_millis(self.settings.timeout_ms);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "Linter could not be started");
                return LintOutcome::Unavailable(format!("{}: {}", self.settings.command, e));
            }
            Err(_) => {
                warn!(timeout_ms = self.settings.timeout_ms, "Linter timed out");
                return LintOutcome::Unavailable(format!(
                    "{} timed out after {} ms",
                    self.settings.command, self.settings.timeout_ms
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(status = ?output.status.code(), bytes = stdout.len(), "Linter finished");

        // flake8 exits 1 when it reports issues, so stdout wins over the code
        if !stdout.is_empty() {
            return LintOutcome::Issues(stdout);
        }
        if output.status.success() {
            return LintOutcome::Clean;
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(status = ?output.status.code(), "Linter crashed");
        LintOutcome::Unavailable(format!(
            "{} exited with {}: {}",
            self.settings.command, output.status, stderr
        ))
    }
}
