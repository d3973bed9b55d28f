// Collaborators the analysis core talks to but never implements itself

use crate::types::{AnalysisRecord, CorpusEntry};
use anyhow::Result;
use async_trait::async_trait;

/// Supplies the peer submissions a new submission is compared against
#[async_trait]
pub trait CorpusProvider: Send + Sync {
    /// Current submissions of every author other than `excluded_author`,
    /// ordered by author id
    async fn corpus_snapshot(
        &self,
        assignment_id: &str,
        excluded_author: &str,
    ) -> Result<Vec<CorpusEntry>>;
}

/// Accepts finished analyses for storage
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn store_record(&self, record: &AnalysisRecord) -> Result<()>;

    /// Make a submission visible to later corpus snapshots
    async fn commit_submission(
        &self,
        assignment_id: &str,
        author_id: &str,
        source: &str,
    ) -> Result<()>;
}
