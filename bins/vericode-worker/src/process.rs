/// Restricted child-process sandbox backend
///
/// For hosts without Docker. Each run gets:
/// - a fresh, uniquely named work directory removed on every exit path
/// - a cleared environment
/// - its own process group, killed as a whole on timeout
/// - rlimits on address space, CPU seconds, file size and core dumps
/// - private user and network namespaces (no network)
/// - a private PID namespace whose init is the program itself
///
/// **PID namespace layout:**
/// The spawned child unshares the namespaces, then forks. The forked
/// process becomes init of the new namespace and execs the interpreter.
/// The original child stays outside as a stand-in: it is the pid the worker
/// waits on and kills, and it relays init's exit status. Init carries a
/// parent-death SIGKILL, so killing the stand-in kills init, and the kernel
/// then kills everything left in the namespace. A descendant that calls
/// `setsid` leaves the process group but never the namespace.
///
/// Namespaces are checked once at startup. Hosts that cannot create them
/// must opt out explicitly with `isolate_network` / `isolate_processes`.

use crate::config::ProcessSettings;
use crate::engine::{classify_exit, OutputBuffer, Sandbox, SandboxError};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vericode_common::types::ExecutionOutcome;

const BACKEND: &str = "process";
const SCRIPT_NAME: &str = "main.py";
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long to keep draining pipes after the child exits
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
struct Limits {
    address_space_bytes: Option<u64>,
    cpu_secs: Option<u64>,
    file_size_bytes: Option<u64>,
    processes: Option<u64>,
    isolate_network: bool,
    isolate_processes: bool,
}

impl Limits {
    fn namespaces(&self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        let mut flags = CloneFlags::empty();
        if self.isolate_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.isolate_processes {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if !flags.is_empty() {
            // Lets an unprivileged worker create the others
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }
}

/// Identity maps for the worker's own ids. Without them the program runs as
/// the overflow user and cannot create files.
#[derive(Debug, Clone)]
struct IdMaps {
    uid_map: String,
    gid_map: String,
}

impl IdMaps {
    fn current() -> Self {
        // SAFETY: getuid and getgid cannot fail
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            uid_map: format!("{} {} 1\n", uid, uid),
            gid_map: format!("{} {} 1\n", gid, gid),
        }
    }
}

/// `path` must be NUL-terminated
fn write_proc_file(path: &[u8], contents: &[u8]) -> io::Result<()> {
    // SAFETY: open, write and close on a NUL-terminated path and a live buffer
    unsafe {
        let fd = libc::open(path.as_ptr().cast(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
        let error = io::Error::last_os_error();
        libc::close(fd);
        if written != contents.len() as isize {
            return Err(error);
        }
    }
    Ok(())
}

fn enter_namespaces(namespaces: nix::sched::CloneFlags, maps: &IdMaps) -> io::Result<()> {
    use nix::sched::CloneFlags;

    nix::sched::unshare(namespaces)?;
    if namespaces.contains(CloneFlags::CLONE_NEWUSER) {
        write_proc_file(b"/proc/self/setgroups\0", b"deny")?;
        write_proc_file(b"/proc/self/uid_map\0", maps.uid_map.as_bytes())?;
        write_proc_file(b"/proc/self/gid_map\0", maps.gid_map.as_bytes())?;
    }
    Ok(())
}

/// Runs in the forked child before exec; only async-signal-safe calls here
fn apply_limits(limits: &Limits, maps: &IdMaps) -> io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    use nix::unistd::setpgid;

    // Lead a fresh group so a timeout can kill every descendant
    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(bytes) = limits.address_space_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if let Some(secs) = limits.cpu_secs {
        setrlimit(Resource::RLIMIT_CPU, secs, secs)?;
    }
    if let Some(bytes) = limits.file_size_bytes {
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    if let Some(count) = limits.processes {
        setrlimit(Resource::RLIMIT_NPROC, count, count)?;
    }
    let namespaces = limits.namespaces();
    if !namespaces.is_empty() {
        enter_namespaces(namespaces, maps)?;
    }
    if limits.isolate_processes {
        fork_namespace_init()?;
    }
    Ok(())
}

/// Returns in the namespace init, which goes on to exec. The stand-in
/// never returns.
fn fork_namespace_init() -> io::Result<()> {
    use nix::sys::prctl::set_pdeathsig;
    use nix::unistd::{fork, ForkResult};

    // SAFETY: the child goes straight on to exec; the parent only makes
    // raw syscalls until it exits
    match unsafe { fork() }? {
        ForkResult::Child => {
            set_pdeathsig(Signal::SIGKILL)?;
            Ok(())
        }
        ForkResult::Parent { child } => relay_exit(child),
    }
}

fn relay_exit(init: Pid) -> ! {
    use nix::errno::Errno;
    use nix::sys::signal::{raise, signal, SigHandler};
    use nix::sys::wait::{waitpid, WaitStatus};

    // Holding no descriptors lets the spawner see init's exec and lets
    // the pipes close once init's side is gone
    // SAFETY: sysconf takes a plain integer
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let open_max = if open_max > 0 { open_max.min(65_536) } else { 1024 };
    for fd in 0..open_max as libc::c_int {
        // SAFETY: closing a descriptor number, open or not
        unsafe {
            libc::close(fd);
        }
    }

    let code = loop {
        match waitpid(init, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // Die the same way so the worker sees the signal
                // SAFETY: restoring the default disposition
                let _ = unsafe { signal(sig, SigHandler::SigDfl) };
                let _ = raise(sig);
                break 128 + sig as i32;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break 127,
        }
    };

    // SAFETY: terminates this process without running atexit handlers
    unsafe { libc::_exit(code) }
}

fn kill_group(pgid: Option<Pid>) {
    if let Some(pgid) = pgid {
        // ESRCH just means the group is already gone
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut buffer = OutputBuffer::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.push(&chunk[..n]),
        }
    }
    buffer.into_string()
}

/// Join a drain task, giving up after `grace` if something still holds the pipe
async fn collect(task: Option<JoinHandle<String>>, grace: Duration) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

pub struct ProcessEngine {
    settings: ProcessSettings,
    max_output_bytes: usize,
}

impl ProcessEngine {
    pub fn new(settings: ProcessSettings, max_output_bytes: usize) -> Result<Self, SandboxError> {
        if settings.interpreter.is_empty() {
            return Err(SandboxError::Unavailable {
                backend: BACKEND,
                reason: "no interpreter configured".to_string(),
            });
        }
        if !settings.isolate_network {
            warn!("Process sandbox runs without network isolation");
        }
        if !settings.isolate_processes {
            warn!("Process sandbox runs without a PID namespace");
        }

        let engine = Self {
            settings,
            max_output_bytes,
        };
        engine.check_namespaces()?;
        Ok(engine)
    }

    /// Refuse to start when the configured namespaces cannot be created
    fn check_namespaces(&self) -> Result<(), SandboxError> {
        use std::os::unix::process::CommandExt;

        let namespaces = self.limits().namespaces();
        if namespaces.is_empty() {
            return Ok(());
        }
        let Some((program, args)) = self.settings.interpreter.split_first() else {
            return Ok(());
        };

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let maps = IdMaps::current();
        // SAFETY: enter_namespaces only issues raw syscalls
        unsafe {
            cmd.pre_exec(move || enter_namespaces(namespaces, &maps));
        }

        match cmd.status() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SandboxError::Unavailable {
                backend: BACKEND,
                reason: format!("interpreter '{}' not found", program),
            }),
            Err(e) => Err(SandboxError::Unavailable {
                backend: BACKEND,
                reason: format!(
                    "cannot create namespaces ({}); set isolate_network and \
                     isolate_processes to false to run without them",
                    e
                ),
            }),
        }
    }

    fn limits(&self) -> Limits {
        let mb = |value: u64| value * 1024 * 1024;
        Limits {
            address_space_bytes: self.settings.memory_limit_mb.map(mb),
            cpu_secs: self.settings.cpu_time_limit_secs,
            file_size_bytes: self.settings.max_file_size_mb.map(mb),
            processes: self.settings.max_processes,
            isolate_network: self.settings.isolate_network,
            isolate_processes: self.settings.isolate_processes,
        }
    }
}

#[async_trait]
impl Sandbox for ProcessEngine {
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

        let workdir = tempfile::Builder::new()
            .prefix("vericode-")
            .tempdir()
            .map_err(|e| {
                SandboxError::Allocation(format!("failed to create work directory: {}", e))
            })?;
        let script = workdir.path().join(SCRIPT_NAME);
        tokio::fs::write(&script, source)
            .await
            .map_err(|e| SandboxError::Allocation(format!("failed to write source: {}", e)))?;

        let (program, args) = self
            .settings
            .interpreter
            .split_first()
            .ok_or_else(|| SandboxError::Unavailable {
                backend: BACKEND,
                reason: "no interpreter configured".to_string(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(SCRIPT_NAME)
            .current_dir(workdir.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir.path())
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limits = self.limits();
        let maps = IdMaps::current();
        // SAFETY: apply_limits only issues raw syscalls (setpgid, setrlimit,
        // unshare, open/write, fork, prctl, waitpid) and does not allocate
        unsafe {
            cmd.pre_exec(move || apply_limits(&limits, &maps));
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SandboxError::Unavailable {
                backend: BACKEND,
                reason: format!("interpreter '{}' not found", program),
            },
            _ => SandboxError::Allocation(format!("failed to spawn '{}': {}", program, e)),
        })?;

        // The child leads its own group, so its pid is the group id. With a
        // PID namespace the child is the stand-in and init shares its group.
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));

        let stdin_task = child.stdin.take().map(|mut pipe| {
            let data = stdin.as_bytes().to_vec();
            tokio::spawn(async move {
                // A program that never reads stdin closes the pipe early
                let _ = pipe.write_all(&data).await;
            })
        });
        let limit = self.max_output_bytes;
        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(drain(pipe, limit)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(drain(pipe, limit)));

        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // Reap stragglers left behind in the group
                kill_group(pgid);
                let stdout = collect(stdout_task, DRAIN_GRACE).await;
                let mut stderr = collect(stderr_task, DRAIN_GRACE).await;

                if let Some(signal) = status.signal() {
                    stderr.push_str(&format!("\n[Process terminated by signal {}]", signal));
                }

                let duration_ms = start_time.elapsed().as_millis() as u64;
                classify_exit(status.code().map(i64::from), stdout, stderr, duration_ms)
            }
            Ok(Err(e)) => {
                kill_group(pgid);
                ExecutionOutcome::RuntimeError {
                    stderr: format!("Execution failed: {}", e),
                    exit_code: None,
                    duration_ms: start_time.elapsed().as_millis() as u64,
                }
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Execution timed out, killing process group"
                );
                kill_group(pgid);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Child already gone after group kill");
                }
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                ExecutionOutcome::Timeout {
                    duration_ms: start_time.elapsed().as_millis() as u64,
                }
            }
        };

        if let Some(task) = stdin_task {
            task.abort();
        }

        if let Err(e) = workdir.close() {
            warn!(error = %e, "Failed to remove work directory");
        }

        debug!(
            status = ?outcome.status(),
            duration_ms = outcome.duration_ms(),
            "Process run finished"
        );

        Ok(outcome)
    }
}
