use crate::store::{CorpusProvider, ReportSink};
use crate::types::{AnalysisJob, AnalysisRecord, CorpusEntry};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};
use async_trait::async_trait;
use std::collections::HashMap;

/// Redis key semantics shared by the worker and the CLI.
/// Both sides must build keys through these helpers so they never drift.

pub const QUEUE_KEY: &str = "vericode:queue:analysis";
pub const RESULT_PREFIX: &str = "vericode:result";
pub const STATUS_PREFIX: &str = "vericode:status";
pub const SUBMISSIONS_PREFIX: &str = "vericode:submissions";

/// Finished records expire after 24 hours
pub const RECORD_TTL_SECONDS: u64 = 86400;

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

/// Hash of author id -> latest source for one assignment
pub fn submissions_key(assignment_id: &str) -> String {
    format!("{}:{}", SUBMISSIONS_PREFIX, assignment_id)
}

fn codec_error(what: &'static str, e: serde_json::Error) -> RedisError {
    RedisError::from((ErrorKind::TypeError, what, e.to_string()))
}

/// Push a job onto the analysis queue (RPUSH, FIFO with BLPOP)
pub async fn push_job(conn: &mut ConnectionManager, job: &AnalysisJob) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(|e| codec_error("serialization error", e))?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop the next job, waiting at most `timeout_seconds` so callers can
/// notice shutdown between polls
pub async fn pop_job(
    conn: &mut ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<AnalysisJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: AnalysisJob = serde_json::from_str(&payload)
                .map_err(|e| codec_error("deserialization error", e))?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

pub async fn store_record(
    conn: &mut ConnectionManager,
    record: &AnalysisRecord,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(record).map_err(|e| codec_error("serialization error", e))?;
    let _: () = conn
        .set_ex(result_key(&record.job_id), payload, RECORD_TTL_SECONDS as _)
        .await?;

    // Status is kept separately for cheap polling
    let status =
        serde_json::to_string(&record.status).map_err(|e| codec_error("serialization error", e))?;
    let _: () = conn
        .set_ex(status_key(&record.job_id), status, RECORD_TTL_SECONDS as _)
        .await?;

    Ok(())
}

pub async fn get_record(
    conn: &mut ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<AnalysisRecord>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let record: AnalysisRecord = serde_json::from_str(&data)
                .map_err(|e| codec_error("deserialization error", e))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub async fn commit_submission(
    conn: &mut ConnectionManager,
    assignment_id: &str,
    author_id: &str,
    source: &str,
) -> RedisResult<()> {
    conn.hset(submissions_key(assignment_id), author_id, source)
        .await
}

pub async fn load_corpus(
    conn: &mut ConnectionManager,
    assignment_id: &str,
    excluded_author: Option<&str>,
) -> RedisResult<Vec<CorpusEntry>> {
    let submissions: HashMap<String, String> =
        conn.hgetall(submissions_key(assignment_id)).await?;
    Ok(corpus_from_submissions(submissions, excluded_author))
}

/// Order a raw submissions hash by author and drop the excluded author
pub fn corpus_from_submissions(
    submissions: HashMap<String, String>,
    excluded_author: Option<&str>,
) -> Vec<CorpusEntry> {
    let mut corpus: Vec<CorpusEntry> = submissions
        .into_iter()
        .filter(|(author, _)| Some(author.as_str()) != excluded_author)
        .map(|(author, source)| CorpusEntry::new(author, source))
        .collect();
    corpus.sort_by(|a, b| a.author_id.cmp(&b.author_id));
    corpus
}

/// Redis-backed corpus provider and persistence sink
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CorpusProvider for RedisStore {
    async fn corpus_snapshot(
        &self,
        assignment_id: &str,
        excluded_author: &str,
    ) -> anyhow::Result<Vec<CorpusEntry>> {
        let mut conn = self.conn.clone();
        Ok(load_corpus(&mut conn, assignment_id, Some(excluded_author)).await?)
    }
}

#[async_trait]
impl ReportSink for RedisStore {
    async fn store_record(&self, record: &AnalysisRecord) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        Ok(store_record(&mut conn, record).await?)
    }

    async fn commit_submission(
        &self,
        assignment_id: &str,
        author_id: &str,
        source: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        Ok(commit_submission(&mut conn, assignment_id, author_id, source).await?)
    }
}
