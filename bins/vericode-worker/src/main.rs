mod config;
mod docker;
mod engine;
mod evaluator;
mod executor;
mod linter;
mod process;
mod runner;
mod similarity;

#[cfg(test)]
mod engine_tests;

use config::{SandboxBackend, WorkerConfig};
use docker::DockerEngine;
use engine::{ExecutionPool, Sandbox};
use executor::Analyzer;
use linter::Linter;
use process::ProcessEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use vericode_common::redis::{self, RedisStore};
use vericode_common::store::{CorpusProvider, ReportSink};
use vericode_common::types::{AnalysisJob, AnalysisRecord, JobStatus};

/// How long shutdown waits for in-flight analyses
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

async fn build_sandbox(config: &WorkerConfig) -> anyhow::Result<Arc<dyn Sandbox>> {
    let max_output = config.sandbox.max_output_bytes;
    match config.sandbox.backend {
        SandboxBackend::Docker => {
            let engine = DockerEngine::new(config.sandbox.docker.clone(), max_output)?;
            engine.verify().await?;
            info!(image = %config.sandbox.docker.image, "Docker sandbox ready");
            Ok(Arc::new(engine))
        }
        SandboxBackend::Process => {
            let engine = ProcessEngine::new(config.sandbox.process.clone(), max_output)?;
            info!(interpreter = ?config.sandbox.process.interpreter, "Process sandbox ready");
            Ok(Arc::new(engine))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Vericode Worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load worker configuration: {}", e);
        e
    })?;

    let sandbox = build_sandbox(&config).await.map_err(|e| {
        error!(backend = %config.sandbox.backend, "Sandbox backend unavailable: {}", e);
        e
    })?;

    let pool = ExecutionPool::new(sandbox, config.concurrency.max_parallel_processes);

    info!(
        backend = pool.backend(),
        linter = %config.linter.command,
        max_parallel_jobs = config.concurrency.max_parallel_jobs,
        execution_slots = pool.capacity(),
        "Worker configured"
    );

    let analyzer = Analyzer::new(pool, Linter::new(config.linter.clone()));

    // Connect to Redis
    let redis_url = vericode_common::config::Config::from_env().redis_url;
    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    let store = RedisStore::new(redis_conn.clone());

    info!("Connected to Redis: {}", redis_url);

    let max_jobs = config.concurrency.max_parallel_jobs.max(1);
    let job_slots = Arc::new(Semaphore::new(max_jobs));

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, draining in-flight analyses...");
    };

    tokio::select! {
        result = worker_loop(&mut redis_conn, store, analyzer, job_slots.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "Worker loop stopped");
            }
        },
        _ = shutdown => {},
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, job_slots.acquire_many(max_jobs as u32)).await {
        Ok(_) => info!("All in-flight analyses finished"),
        Err(_) => warn!(
            timeout_s = DRAIN_TIMEOUT.as_secs(),
            "Gave up waiting for in-flight analyses"
        ),
    }

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    store: RedisStore,
    analyzer: Analyzer,
    job_slots: Arc<Semaphore>,
) -> anyhow::Result<()> {
    loop {
        // Only take a job off the queue once there is room to run it
        let permit = job_slots.clone().acquire_owned().await?;

        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_job(redis_conn, 5.0).await {
            Ok(Some(job)) => {
                info!(
                    job_id = %job.id,
                    assignment = %job.assignment_id,
                    author = %job.author_id,
                    source_size = job.source_code.len(),
                    has_tests = job.tests.is_some(),
                    "Received job"
                );

                let analyzer = analyzer.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    process_job(&analyzer, &store, job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Analyze one job and persist the outcome. A completed submission joins
/// the corpus only after its own analysis, so it is never compared with
/// itself.
#[instrument(skip_all, fields(job_id = %job.id))]
async fn process_job<S>(analyzer: &Analyzer, store: &S, job: AnalysisJob) -> JobStatus
where
    S: CorpusProvider + ReportSink,
{
    let start = std::time::Instant::now();

    let record = match store
        .corpus_snapshot(&job.assignment_id, &job.author_id)
        .await
    {
        Ok(corpus) => {
            debug!(corpus_size = corpus.len(), "Corpus snapshot taken");
            match analyzer
                .analyze(
                    &job.source_code,
                    job.expected_output.as_deref(),
                    job.tests.as_deref(),
                    corpus,
                )
                .await
            {
                Ok(report) => AnalysisRecord::completed(&job, report),
                Err(e) => {
                    error!(error = %e, "Analysis failed");
                    AnalysisRecord::failed(&job, e.to_string())
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Corpus snapshot unavailable");
            AnalysisRecord::failed(&job, format!("corpus unavailable: {}", e))
        }
    };

    info!(
        status = ?record.status,
        execution_ms = start.elapsed().as_millis() as u64,
        "Job finished"
    );

    match store.store_record(&record).await {
        Ok(_) => info!("Record persisted"),
        Err(e) => {
            // Non-fatal - worker continues
            error!(error = %e, "Failed to persist record");
        }
    }

    if record.status == JobStatus::Completed {
        if let Err(e) = store
            .commit_submission(&job.assignment_id, &job.author_id, &job.source_code)
            .await
        {
            error!(error = %e, "Failed to commit submission to corpus");
        }
    }

    record.status
}
