/// Docker sandbox backend
///
/// **Docker Execution Rules:**
/// 1. Pulls the configured image if not present
/// 2. Creates one throw-away container per run with:
///    - Network disabled
///    - Memory ceiling (no swap), CPU quota, PID ceiling
///    - Read-only root filesystem, tmpfs work area
///    - All capabilities dropped, no-new-privileges, unprivileged user
/// 3. Injects the source base64-encoded through the environment, split into
///    chunks that each stay under the kernel's per-string limit
/// 4. Streams stdin over an attach, straight into the interpreter
/// 5. Captures stdout/stderr from the same attach (bounded)
/// 6. Kills the container on timeout, which takes every descendant with it
/// 7. Removes the container on every exit path

use crate::config::DockerSettings;
use crate::engine::{classify_exit, OutputBuffer, Sandbox, SandboxError};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use vericode_common::types::ExecutionOutcome;

const BACKEND: &str = "docker";
const WORK_DIR: &str = "/sandbox";
const SOURCE_VAR: &str = "SOURCE_CODE";

/// Longest single environment string execve accepts (MAX_ARG_STRLEN)
const ENV_STRING_LIMIT: usize = 128 * 1024;

/// Base64 characters per source variable, a multiple of 4
const SOURCE_CHUNK_CHARS: usize = 64 * 1024;

/// The default ctrl-p,ctrl-q would cut stdin short if a test input held it
const DETACH_KEYS: &str = "ctrl-^,ctrl-@,ctrl-_,ctrl-@,ctrl-^";

/// `SOURCE_CODE_<n>=<base64 chunk>` entries, in order
fn source_env(source: &str) -> Vec<String> {
    let encoded = general_purpose::STANDARD.encode(source);
    (0..encoded.len())
        .step_by(SOURCE_CHUNK_CHARS)
        .enumerate()
        .map(|(index, start)| {
            let end = (start + SOURCE_CHUNK_CHARS).min(encoded.len());
            format!("{}_{}={}", SOURCE_VAR, index, &encoded[start..end])
        })
        .collect()
}

/// Container cleanup guard - guarantees container removal on drop
/// This ensures containers are cleaned up even if execution panics or is cancelled
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Drop cannot await; removal runs on the runtime in the background
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker
                .remove_container(&container_id, Some(remove_options))
                .await
            {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

pub struct DockerEngine {
    docker: Docker,
    settings: DockerSettings,
    max_output_bytes: usize,
}

impl DockerEngine {
    pub fn new(settings: DockerSettings, max_output_bytes: usize) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::Unavailable {
                backend: BACKEND,
                reason: format!("failed to connect to Docker daemon: {}", e),
            }
        })?;

        Ok(Self {
            docker,
            settings,
            max_output_bytes,
        })
    }

    /// Check the daemon answers and the image is present
    pub async fn verify(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable {
                backend: BACKEND,
                reason: format!("Docker daemon did not answer ping: {}", e),
            })?;
        self.ensure_image().await
    }

    /// Image cache health check: pull synchronously on a miss
    async fn ensure_image(&self) -> Result<(), SandboxError> {
        let image = self.settings.image.as_str();

        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Unavailable {
                backend: BACKEND,
                reason: format!("failed to pull image '{}': {}", image, e),
            })?;
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    /// Shell line run inside the container: reassemble the source into the
    /// tmpfs, scrub it from the environment, then hand over to the
    /// interpreter, which inherits the attached stdin
    fn run_command(&self, chunks: usize) -> Vec<String> {
        let vars: Vec<String> = (0..chunks).map(|i| format!("{}_{}", SOURCE_VAR, i)).collect();
        let expansions: String = vars.iter().map(|var| format!(" \"${}\"", var)).collect();

        let mut steps = vec![
            format!("cd {}", WORK_DIR),
            format!("printf '%s'{} | base64 -d > main.py", expansions),
        ];
        if !vars.is_empty() {
            steps.push(format!("unset {}", vars.join(" ")));
        }
        steps.push(format!("exec {} main.py", self.settings.interpreter));

        vec!["sh".to_string(), "-c".to_string(), steps.join(" && ")]
    }

    fn container_config(&self, source: &str) -> Config<String> {
        let memory = i64::from(self.settings.memory_limit_mb) * 1024 * 1024;
        let nano_cpus = (f64::from(self.settings.cpu_limit) * 1_000_000_000.0) as i64;

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            WORK_DIR.to_string(),
            format!(
                "rw,exec,nosuid,nodev,size={}m,mode=1777",
                self.settings.tmpfs_size_mb
            ),
        );

        let env = source_env(source);

        Config {
            image: Some(self.settings.image.clone()),
            cmd: Some(self.run_command(env.len())),
            entrypoint: Some(vec![]),
            env: Some(env),
            user: Some(self.settings.user.clone()),
            working_dir: Some(WORK_DIR.to_string()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            // Closing our end of the attach closes the program's stdin
            stdin_once: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(self.settings.pids_limit),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Sandbox for DockerEngine {
    fn name(&self) -> &'static str {
        BACKEND
    }

    #[tracing::instrument(
        skip(self, source, stdin),
        fields(timeout_ms = timeout.as_millis() as u64)
    )]
    async fn execute(
        &self,
        source: &str,
        stdin: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let start_time = Instant::now();
        let container_name = format!("vericode-{}", uuid::Uuid::new_v4());

        self.ensure_image().await?;

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(source))
            .await
            .map_err(|e| SandboxError::Allocation(format!("failed to create container: {}", e)))?;

        let container_id = container.id.clone();

        // Set up the cleanup guard before anything else can fail
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        // Attach before start so no output is missed
        let attach_options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: Some(DETACH_KEYS.to_string()),
        };
        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .docker
            .attach_container(&container_id, Some(attach_options))
            .await
            .map_err(|e| {
                SandboxError::Allocation(format!("failed to attach to container: {}", e))
            })?;

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Allocation(format!("failed to start container: {}", e)))?;

        let payload = stdin.as_bytes().to_vec();
        let feeder = tokio::spawn(async move {
            // A program that exits without reading its input breaks the write
            if input.write_all(&payload).await.is_ok() {
                let _ = input.shutdown().await;
            }
        });

        let limit = self.max_output_bytes;
        let execution_future = async {
            let mut stdout = OutputBuffer::new(limit);
            let mut stderr = OutputBuffer::new(limit);

            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container output");
                        break;
                    }
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait_stream = self.docker.wait_container(&container_id, Some(wait_options));

            // Non-zero exits surface as a wait error carrying the code
            let exit_code = match wait_stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to get container exit code");
                    None
                }
                None => {
                    warn!("No wait response from container");
                    None
                }
            };

            (stdout.into_string(), stderr.into_string(), exit_code)
        };

        let outcome = match tokio::time::timeout(timeout, execution_future).await {
            Ok((stdout, mut stderr, exit_code)) => {
                match exit_code {
                    Some(137) => {
                        stderr.push_str("\n[Container killed: likely OOM or exceeded memory limit]")
                    }
                    Some(139) => stderr.push_str("\n[Container killed: segmentation fault]"),
                    _ => {}
                }
                let duration_ms = start_time.elapsed().as_millis() as u64;
                classify_exit(exit_code, stdout, stderr, duration_ms)
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Execution timed out, killing container"
                );

                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }

                ExecutionOutcome::Timeout {
                    duration_ms: start_time.elapsed().as_millis() as u64,
                }
            }
        };

        feeder.abort();

        debug!(
            container = %container_name,
            status = ?outcome.status(),
            duration_ms = outcome.duration_ms(),
            "Container run finished"
        );

        Ok(outcome)
    }
}
