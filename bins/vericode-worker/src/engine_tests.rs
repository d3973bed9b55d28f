/// Integration tests for the sandbox backends
///
/// The process backend is driven with `sh` as its interpreter so these run
/// on any Unix host:
/// 1. Programs read stdin and produce stdout
/// 2. Non-zero exits surface as runtime errors with stderr
/// 3. Timeouts kill the whole process group and return promptly
/// 4. With a PID namespace, descendants that leave the group die too
/// 5. Work directories are removed after every run
/// 6. Output beyond the cap is truncated
///
/// Docker tests need a running daemon and are ignored by default.

#[cfg(test)]
mod process_backend_tests {
    use crate::config::ProcessSettings;
    use crate::engine::{ExecutionPool, Sandbox, SandboxError};
    use crate::process::ProcessEngine;
    use crate::runner::TestRunner;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use vericode_common::types::{ExecutionOutcome, ExecutionStatus};

    fn sh_settings() -> ProcessSettings {
        ProcessSettings {
            interpreter: vec!["sh".to_string()],
            memory_limit_mb: None,
            cpu_time_limit_secs: Some(10),
            max_file_size_mb: Some(8),
            max_processes: None,
            isolate_network: false,
            isolate_processes: false,
        }
    }

    fn sh_engine() -> ProcessEngine {
        ProcessEngine::new(sh_settings(), 64 * 1024).unwrap()
    }

    /// `None` when the host cannot create user namespaces
    fn isolated_engine() -> Option<ProcessEngine> {
        let mut settings = sh_settings();
        settings.isolate_network = true;
        settings.isolate_processes = true;
        match ProcessEngine::new(settings, 64 * 1024) {
            Ok(engine) => Some(engine),
            Err(e) => {
                eprintln!("Skipping namespace test: {}", e);
                None
            }
        }
    }

    /// Any process whose argv is exactly `args`
    fn process_running(args: &[&str]) -> bool {
        let wanted: Vec<u8> = args.iter().flat_map(|a| a.bytes().chain([0])).collect();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return false;
        };
        entries
            .flatten()
            .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
            .any(|cmdline| cmdline == wanted)
    }

    /// The kernel tears a namespace down asynchronously
    async fn gone_within(args: &[&str], wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if !process_running(args) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !process_running(args)
    }

    const SUM: &str = "read a\nread b\necho $((a + b))\n";

    #[tokio::test]
    async fn test_reads_stdin_and_prints_sum() {
        let outcome = sh_engine()
            .execute(SUM, "5\n3\n", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.status(), ExecutionStatus::Success);
        assert_eq!(outcome.stdout(), Some("8\n"));
    }

    #[tokio::test]
    async fn test_empty_stdin_is_closed() {
        // `read` hits EOF right away instead of blocking
        let outcome = sh_engine()
            .execute("read x || echo Hello\n", "", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("Hello\n"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let script = "echo partial\necho 'ZeroDivisionError: division by zero' >&2\nexit 1\n";
        let outcome = sh_engine()
            .execute(script, "", Duration::from_secs(5))
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::RuntimeError {
                stderr, exit_code, ..
            } => {
                assert!(stderr.contains("ZeroDivisionError"));
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("expected RuntimeError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out_promptly() {
        let start = Instant::now();
        let outcome = sh_engine()
            .execute("while :; do :; done\n", "", Duration::from_millis(1000))
            .await
            .unwrap();

        assert_eq!(outcome.status(), ExecutionStatus::Timeout);
        assert!(outcome.duration_ms() >= 1000);
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_timeout_kills_descendants() {
        let start = Instant::now();
        let outcome = sh_engine()
            .execute("sleep 30 &\nwait\n", "", Duration::from_millis(500))
            .await
            .unwrap();

        assert_eq!(outcome.status(), ExecutionStatus::Timeout);
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_timeout_kills_descendants_that_leave_the_group() {
        let Some(engine) = isolated_engine() else {
            return;
        };
        let start = Instant::now();
        let script = "setsid sleep 4319 >/dev/null 2>&1 &\nwhile :; do :; done\n";
        let outcome = engine
            .execute(script, "", Duration::from_millis(500))
            .await
            .unwrap();

        assert_eq!(outcome.status(), ExecutionStatus::Timeout);
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert!(gone_within(&["sleep", "4319"], Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_exit_kills_descendants_that_leave_the_group() {
        let Some(engine) = isolated_engine() else {
            return;
        };
        let script = "setsid sleep 4327 >/dev/null 2>&1 &\necho done\n";
        let outcome = engine
            .execute(script, "", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("done\n"));
        assert!(gone_within(&["sleep", "4327"], Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_isolated_run_can_write_files() {
        let Some(engine) = isolated_engine() else {
            return;
        };
        let outcome = engine
            .execute("echo kept > out.txt\ncat out.txt\n", "", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("kept\n"));
    }

    #[tokio::test]
    async fn test_isolated_run_relays_exit_status() {
        let Some(engine) = isolated_engine() else {
            return;
        };
        let outcome = engine
            .execute("read a\necho \"got $a\"\nexit 3\n", "7\n", Duration::from_secs(5))
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::RuntimeError { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("expected RuntimeError, got {:?}", other),
        }

        let outcome = engine
            .execute(SUM, "5\n3\n", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.stdout(), Some("8\n"));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_output() {
        let start = Instant::now();
        let outcome = sh_engine()
            .execute("sleep 30 &\necho done\n", "", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("done\n"));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_workdir_removed_after_run() {
        let outcome = sh_engine()
            .execute("pwd\nls\n", "", Duration::from_secs(5))
            .await
            .unwrap();

        let stdout = outcome.stdout().unwrap();
        let mut lines = stdout.lines();
        let workdir = lines.next().unwrap();
        assert!(workdir.contains("vericode-"));
        assert_eq!(lines.next(), Some("main.py"));
        assert!(!std::path::Path::new(workdir).exists());
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("VERICODE_TEST_SECRET", "leaked");
        let outcome = sh_engine()
            .execute("echo \"[$VERICODE_TEST_SECRET]\"\n", "", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("[]\n"));
    }

    #[tokio::test]
    async fn test_large_output_is_truncated() {
        let engine = ProcessEngine::new(sh_settings(), 1024).unwrap();
        let script = "i=0\nwhile [ $i -lt 500 ]; do echo 0123456789; i=$((i + 1)); done\n";
        let outcome = engine
            .execute(script, "", Duration::from_secs(5))
            .await
            .unwrap();

        let stdout = outcome.stdout().unwrap();
        assert!(stdout.ends_with("[output truncated at 1024 bytes]"));
        assert!(stdout.len() < 1200);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_unavailable() {
        let mut settings = sh_settings();
        settings.interpreter = vec!["vericode-no-such-interpreter".to_string()];
        let engine = ProcessEngine::new(settings, 1024).unwrap();

        let result = engine.execute("", "", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SandboxError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_empty_interpreter_rejected() {
        let mut settings = sh_settings();
        settings.interpreter.clear();
        assert!(ProcessEngine::new(settings, 1024).is_err());
    }

    #[tokio::test]
    async fn test_runner_end_to_end() {
        let pool = ExecutionPool::new(Arc::new(sh_engine()), 4);
        let runner = TestRunner::new(pool);

        let summary = runner
            .run_tests(SUM, "5 3 -> 8\n10 -4 -> 6\n1 1 -> 3")
            .await
            .unwrap();

        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.tests_passed, 2);
        assert!(!summary.results[2].passed);
    }

    #[tokio::test]
    async fn test_parallel_runs_are_isolated() {
        let pool = ExecutionPool::new(Arc::new(sh_engine()), 4);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let stdin = format!("{}\n{}\n", i, i);
                    let outcome = pool.execute(SUM, &stdin, Duration::from_secs(5)).await;
                    (i, outcome)
                })
            })
            .collect();

        for handle in handles {
            let (i, outcome) = handle.await.unwrap();
            let expected = format!("{}\n", i * 2);
            assert_eq!(outcome.unwrap().stdout(), Some(expected.as_str()));
        }
    }
}

#[cfg(test)]
mod docker_backend_tests {
    use crate::config::DockerSettings;
    use crate::docker::DockerEngine;
    use crate::engine::Sandbox;
    use std::time::Duration;
    use vericode_common::types::ExecutionStatus;

    async fn engine() -> DockerEngine {
        let engine = DockerEngine::new(DockerSettings::default(), 64 * 1024)
            .expect("Failed to create Docker engine");
        engine.verify().await.expect("Docker daemon unavailable");
        engine
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_sum() {
        let source = "a = int(input())\nb = int(input())\nprint(a + b)\n";
        let outcome = engine()
            .await
            .execute(source, "5\n3\n", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("8\n"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_large_input() {
        let source = "import sys\nprint(len(sys.stdin.read()))\n";
        let stdin = "0123456789\n".repeat(20_000);
        let outcome = engine()
            .await
            .execute(source, &stdin, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.stdout(), Some("220000\n"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_runtime_error() {
        let outcome = engine()
            .await
            .execute("print(1 / 0)\n", "", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(outcome.status(), ExecutionStatus::RuntimeError);
        assert!(outcome.stderr().unwrap().contains("ZeroDivisionError"));
    }
}
