// Worker configuration: sandbox backend, linter and concurrency settings
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/vericode.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Docker,
    Process,
}

impl std::str::FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            other => bail!("Unknown sandbox backend '{}' (expected docker or process)", other),
        }
    }
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Container limits for the Docker backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    pub image: String,
    pub interpreter: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
    pub tmpfs_size_mb: u32,
    /// uid:gid the program runs as inside the container
    pub user: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            interpreter: "python3".to_string(),
            memory_limit_mb: 128,
            cpu_limit: 0.5,
            pids_limit: 64,
            tmpfs_size_mb: 16,
            user: "65534:65534".to_string(),
        }
    }
}

/// Limits for the plain child-process backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Interpreter argv; the script path is appended
    pub interpreter: Vec<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_time_limit_secs: Option<u64>,
    pub max_file_size_mb: Option<u64>,
    pub max_processes: Option<u64>,
    /// Run without network access (private network namespace)
    pub isolate_network: bool,
    /// Run as init of a private PID namespace so no descendant outlives
    /// the run
    pub isolate_processes: bool,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-I".to_string()],
            memory_limit_mb: Some(256),
            cpu_time_limit_secs: Some(10),
            max_file_size_mb: Some(8),
            max_processes: None,
            isolate_network: true,
            isolate_processes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub backend: SandboxBackend,
    pub max_output_bytes: usize,
    pub docker: DockerSettings,
    pub process: ProcessSettings,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            max_output_bytes: 64 * 1024,
            docker: DockerSettings::default(),
            process: ProcessSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinterSettings {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for LinterSettings {
    fn default() -> Self {
        Self {
            command: "flake8".to_string(),
            args: Vec::new(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Concurrency {
    pub max_parallel_jobs: usize,
    pub max_parallel_processes: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            max_parallel_processes: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub sandbox: SandboxSettings,
    pub linter: LinterSettings,
    pub concurrency: Concurrency,
}

impl WorkerConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Worker config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `VERICODE_CONFIG` (or the default path), then apply
    /// environment overrides. A missing file falls back to defaults.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("VERICODE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        if let Ok(backend) = std::env::var("SANDBOX_BACKEND") {
            config.sandbox.backend = backend.parse()?;
        }

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency.max_parallel_jobs == 0 || self.concurrency.max_parallel_processes == 0 {
            bail!("Concurrency limits must be at least 1");
        }
        if self.sandbox.process.interpreter.is_empty() {
            bail!("Process backend interpreter must not be empty");
        }
        if self.linter.command.trim().is_empty() {
            bail!("Linter command must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = WorkerConfig::from_json("{}").unwrap();
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(config.sandbox.max_output_bytes, 64 * 1024);
        assert_eq!(config.linter.command, "flake8");
        assert_eq!(config.concurrency.max_parallel_processes, 8);
    }

    #[test]
    fn test_partial_override() {
        let config = WorkerConfig::from_json(
            r#"{
                "sandbox": { "backend": "process", "process": { "interpreter": ["sh"] } },
                "concurrency": { "max_parallel_jobs": 2 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.sandbox.backend, SandboxBackend::Process);
        assert_eq!(config.sandbox.process.interpreter, vec!["sh".to_string()]);
        assert_eq!(config.sandbox.process.memory_limit_mb, Some(256));
        assert_eq!(config.concurrency.max_parallel_jobs, 2);
        assert_eq!(config.concurrency.max_parallel_processes, 8);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result =
            WorkerConfig::from_json(r#"{ "concurrency": { "max_parallel_processes": 0 } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_process_isolation_on_by_default() {
        let config = WorkerConfig::from_json("{}").unwrap();
        assert!(config.sandbox.process.isolate_network);
        assert!(config.sandbox.process.isolate_processes);

        let opted_out = WorkerConfig::from_json(
            r#"{ "sandbox": { "process": { "isolate_network": false } } }"#,
        )
        .unwrap();
        assert!(!opted_out.sandbox.process.isolate_network);
        assert!(opted_out.sandbox.process.isolate_processes);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("Docker".parse::<SandboxBackend>().unwrap(), SandboxBackend::Docker);
        assert_eq!("process".parse::<SandboxBackend>().unwrap(), SandboxBackend::Process);
        assert!("vm".parse::<SandboxBackend>().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = WorkerConfig::load(Path::new("does/not/exist.json"));
        assert!(result.is_err());
    }
}
