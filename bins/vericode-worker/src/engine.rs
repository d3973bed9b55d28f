/// Execution Sandbox - Abstraction for Running Untrusted Code
///
/// **Core Responsibility:**
/// Run one source artifact as an isolated child with bounded wall-clock time
/// and captured stdio, and classify how it ended.
///
/// **Critical Architectural Boundary:**
/// - The sandbox knows HOW to execute (container, restricted process, ...)
/// - The sandbox does NOT know test specs or expected outputs
/// - The sandbox returns an `ExecutionOutcome` for the harness to judge
///
/// Backends live in `docker.rs` and `process.rs`. Callers only ever see the
/// `Sandbox` trait through an `ExecutionPool`, which bounds how many
/// sandboxed processes run at once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use vericode_common::types::ExecutionOutcome;

/// Payloads above these sizes never reach a backend
pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Failures that leave no usable execution environment.
/// Runtime errors and timeouts are outcomes, not errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox backend '{backend}' is unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("failed to allocate execution environment: {0}")]
    Allocation(String),
}

/// Isolation backend capable of running one program to completion
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `source` with `stdin`, killing it (and every descendant) once
    /// `timeout` elapses. Duration covers the whole call including startup.
    async fn execute(
        &self,
        source: &str,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError>;
}

/// Bounded capture buffer for one output stream.
///
/// Keeps accepting chunks past the limit so the producer never blocks on a
/// full pipe; the excess is dropped and a marker appended on render.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.data.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            text.push_str(&format!("\n... [output truncated at {} bytes]", self.limit));
        }
        text
    }
}

/// Map a finished process to an outcome. A clean exit keeps stdout only,
/// anything else keeps stderr only.
pub fn classify_exit(
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    duration_ms: u64,
) -> ExecutionOutcome {
    match exit_code {
        Some(0) => ExecutionOutcome::Success {
            stdout,
            duration_ms,
        },
        code => ExecutionOutcome::RuntimeError {
            stderr,
            exit_code: code,
            duration_ms,
        },
    }
}

/// Caller-owned limiter on concurrently running sandboxed processes
#[derive(Clone)]
pub struct ExecutionPool {
    sandbox: Arc<dyn Sandbox>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ExecutionPool {
    pub fn new(sandbox: Arc<dyn Sandbox>, max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            sandbox,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.sandbox.name()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run through the backend once a slot is free
    pub async fn execute(
        &self,
        source: &str,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        if source.len() > MAX_SOURCE_CODE_BYTES {
            warn!(bytes = source.len(), "Rejecting oversized source");
            return Ok(ExecutionOutcome::RuntimeError {
                stderr: format!(
                    "Source code exceeds maximum size of {} bytes",
                    MAX_SOURCE_CODE_BYTES
                ),
                exit_code: None,
                duration_ms: 0,
            });
        }
        if stdin.len() > MAX_STDIN_BYTES {
            warn!(bytes = stdin.len(), "Rejecting oversized stdin");
            return Ok(ExecutionOutcome::RuntimeError {
                stderr: format!("Input exceeds maximum size of {} bytes", MAX_STDIN_BYTES),
                exit_code: None,
                duration_ms: 0,
            });
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SandboxError::Allocation("execution pool is closed".to_string()))?;

        debug!(
            backend = self.sandbox.name(),
            available = self.available(),
            timeout_ms = timeout.as_millis() as u64,
            "Acquired execution slot"
        );

        self.sandbox.execute(source, stdin, timeout).await
    }
}
