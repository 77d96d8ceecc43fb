//! Lifecycle of the single backend process
//!
//! Startup runs `cleanup_stale` → `spawn` → `wait_ready` once, before the
//! proxy listener is bound. Every failure here is non-fatal: the gateway
//! keeps serving in a degraded state and answers 503 until the backend
//! becomes reachable.

use crate::config::{BackendConfig, SESSION_SECRET_ENV};
use crate::error::{CleanupFailure, SupervisorError};
use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for the output pipes to flush after an early exit
const PIPE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to wait for the group leader after SIGKILL
const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded buffer of the most recent stderr lines of the backend
#[derive(Clone)]
pub struct LogTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// All retained lines joined with newlines, oldest first
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Handle to the running backend.
///
/// Dropping the handle without calling [`shutdown`](BackendProcess::shutdown)
/// still sends SIGTERM to the process group, so the backend is released on
/// every exit path.
pub struct BackendProcess {
    child: Child,
    pid: u32,
    stderr_tail: LogTail,
    log_tasks: Vec<JoinHandle<()>>,
    grace_period: Duration,
    terminated: bool,
}

impl BackendProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group id; the backend leads its own group
    pub fn pgid(&self) -> u32 {
        self.pid
    }

    /// Exit status if the process has already exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "Failed to poll backend status");
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        !self.terminated && self.exit_status().is_none()
    }

    /// Recent stderr output of the backend
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Terminate the whole process group.
    ///
    /// Sends SIGTERM to the group, waits up to the grace period for the
    /// leader, then sends SIGKILL. Delivery failures (already gone,
    /// permission denied) are logged and swallowed. Calling this twice is a
    /// no-op the second time.
    pub async fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        info!(pid = self.pid, pgid = self.pgid(), "Sending SIGTERM to backend process group");
        self.signal_group(Signal::Term);

        match tokio::time::timeout(self.grace_period, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, ?status, "Backend process exited");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL to backend process group"
                );
                self.signal_group(Signal::Kill);
                let _ = tokio::time::timeout(KILL_WAIT_TIMEOUT, self.child.wait()).await;
            }
        }

        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }

    fn signal_group(&mut self, signal: Signal) {
        if let Err(e) = signal_group(self.pgid(), signal) {
            if e.is_already_gone() {
                debug!(pgid = self.pgid(), "Backend process group already gone");
            } else {
                warn!(pgid = self.pgid(), error = %e, "Failed to signal backend process group");
            }
        }

        #[cfg(not(unix))]
        if matches!(signal, Signal::Kill | Signal::Term) {
            let _ = self.child.start_kill();
        }
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if !self.terminated {
            self.terminated = true;
            debug!(pid = self.pid, "Backend handle dropped, terminating process group");
            self.signal_group(Signal::Term);
        }
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Result of the startup sequence
pub struct Startup {
    /// The backend handle, if a process is still running
    pub backend: Option<BackendProcess>,
    pub status: StartupStatus,
}

#[derive(Debug)]
pub enum StartupStatus {
    /// The backend answered an HTTP request
    Ready { elapsed: Duration },
    /// The gateway runs without a confirmed backend
    Degraded(SupervisorError),
    /// Shutdown was requested before startup finished; any spawned backend
    /// has already been stopped
    Interrupted,
}

impl Startup {
    pub fn is_ready(&self) -> bool {
        matches!(self.status, StartupStatus::Ready { .. })
    }
}

/// Owns the backend launch configuration and runs the startup sequence
pub struct Supervisor {
    config: BackendConfig,
    pool: Arc<ConnectionPool>,
    session_secret: Option<String>,
}

impl Supervisor {
    pub fn new(config: BackendConfig, pool: Arc<ConnectionPool>) -> Self {
        Self {
            config,
            pool,
            session_secret: None,
        }
    }

    /// Pass a session secret to the backend's environment
    pub fn with_session_secret(mut self, secret: impl Into<String>) -> Self {
        self.session_secret = Some(secret.into());
        self
    }

    /// Run the full startup sequence: cleanup, spawn, readiness wait.
    ///
    /// Never fails; problems are reported as [`StartupStatus::Degraded`].
    pub async fn start(&self) -> Startup {
        self.start_until(std::future::pending()).await
    }

    /// Like [`start`](Supervisor::start), but gives up as soon as `shutdown`
    /// completes. A backend spawned by then is shut down before returning
    /// [`StartupStatus::Interrupted`].
    pub async fn start_until<F>(&self, shutdown: F) -> Startup
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interrupted = || Startup {
            backend: None,
            status: StartupStatus::Interrupted,
        };

        tokio::select! {
            _ = self.cleanup_stale() => {}
            _ = &mut shutdown => {
                info!("Shutdown requested during stale cleanup");
                return interrupted();
            }
        }

        // A backend spawned inside the cancelled future is dropped, which
        // signals its group
        let spawned = tokio::select! {
            result = self.spawn() => result,
            _ = &mut shutdown => {
                info!("Shutdown requested while spawning the backend");
                return interrupted();
            }
        };

        let mut backend = match spawned {
            Ok(backend) => backend,
            Err(e) => {
                error!(error = %e, "Backend failed to start, continuing in degraded mode");
                return Startup {
                    backend: None,
                    status: StartupStatus::Degraded(e),
                };
            }
        };

        let ready = tokio::select! {
            result = self.wait_ready(&mut backend) => Some(result),
            _ = &mut shutdown => None,
        };
        let Some(ready) = ready else {
            info!(pid = backend.pid(), "Shutdown requested before the backend was ready");
            backend.shutdown().await;
            return interrupted();
        };

        match ready {
            Ok(elapsed) => {
                info!(
                    port = self.config.port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Backend is ready to serve requests"
                );
                Startup {
                    backend: Some(backend),
                    status: StartupStatus::Ready { elapsed },
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Backend failed to initialize properly, requests will fail until it becomes reachable"
                );
                let backend = backend.is_running().then_some(backend);
                Startup {
                    backend,
                    status: StartupStatus::Degraded(e),
                }
            }
        }
    }

    /// Terminate leftovers of earlier runs that match the launch signature,
    /// then wait for the port to be released.
    ///
    /// Best effort: never fails, errors are logged. Returns how many
    /// processes were signaled (on non-Linux Unix, 1 means "at least one").
    pub async fn cleanup_stale(&self) -> usize {
        let pattern = match self.config.stale_pattern() {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(error = %e, "Cannot derive stale process pattern, skipping cleanup");
                return 0;
            }
        };

        let shown = pattern.join(" ");
        debug!(pattern = %shown, "Looking for stale backend processes");
        let signaled = terminate_matching(pattern).await;
        if signaled > 0 {
            info!(pattern = %shown, count = signaled, "Terminated stale backend processes");
        }

        tokio::time::sleep(self.config.cleanup_settle()).await;
        signaled
    }

    /// Launch the backend in its own process group with piped output.
    pub async fn spawn(&self) -> Result<BackendProcess, SupervisorError> {
        let (program, args) = self
            .config
            .command_line()
            .map_err(|e| SupervisorError::Command(e.to_string()))?;

        info!(
            command = %program,
            args = ?args,
            addr = %self.config.addr(),
            root = %self.config.root,
            "Starting backend"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(ref secret) = self.session_secret {
            cmd.env(SESSION_SECRET_ENV, secret);
        }

        // Own process group, so the backend and its children can be
        // signaled together without touching the gateway
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(pid, "Backend process spawned");

        let stderr_tail = LogTail::new(self.config.log_tail_lines);
        let mut log_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(tokio::spawn(forward_output(stdout, "stdout", None)));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(forward_output(
                stderr,
                "stderr",
                Some(stderr_tail.clone()),
            )));
        }

        let mut backend = BackendProcess {
            child,
            pid,
            stderr_tail,
            log_tasks,
            grace_period: self.config.shutdown_grace_period(),
            terminated: false,
        };

        tokio::time::sleep(self.config.spawn_check()).await;

        if let Some(status) = backend.exit_status() {
            return Err(backend.into_early_exit(status).await);
        }

        Ok(backend)
    }

    /// Poll the backend root until it answers any HTTP response.
    ///
    /// Status codes are ignored: a 404 or 500 still proves the process is
    /// accepting connections. Returns the time it took.
    pub async fn wait_ready(
        &self,
        backend: &mut BackendProcess,
    ) -> Result<Duration, SupervisorError> {
        let timeout = self.config.ready_timeout();
        let probe_timeout = self.config.ready_probe_timeout();
        let interval = self.config.ready_poll_interval();
        let url = format!("{}/", self.config.base_url());
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| SupervisorError::Command(format!("invalid probe url {}: {}", url, e)))?;
        let start = Instant::now();

        debug!(%url, timeout_secs = timeout.as_secs(), "Waiting for backend to respond");

        loop {
            if let Some(status) = backend.exit_status() {
                return Err(backend.into_early_exit(status).await);
            }

            match tokio::time::timeout(probe_timeout, self.pool.probe(uri.clone())).await {
                Ok(Ok(status)) => {
                    info!(status = status.as_u16(), "Backend responded");
                    return Ok(start.elapsed());
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Backend not ready yet");
                }
                Err(_) => {
                    debug!(
                        timeout_secs = probe_timeout.as_secs(),
                        "Readiness probe timed out"
                    );
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(SupervisorError::ReadyTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(interval.min(timeout - elapsed)).await;
        }
    }
}

impl BackendProcess {
    /// Build the early-exit error once the output pipes had a chance to
    /// drain into the stderr tail.
    ///
    /// The leader is gone but children it forked may still hold the group
    /// (and the output pipes), so the group is signaled first.
    async fn into_early_exit(&mut self, status: ExitStatus) -> SupervisorError {
        self.signal_group(Signal::Term);
        self.terminated = true;
        for task in self.log_tasks.iter_mut() {
            let _ = tokio::time::timeout(PIPE_FLUSH_TIMEOUT, task).await;
        }
        self.log_tasks.clear();

        let stderr = self.stderr_tail();
        error!(pid = self.pid, ?status, stderr = %stderr, "Backend exited during startup");
        SupervisorError::EarlyExit { status, stderr }
    }
}

/// Re-emit backend output through the gateway's log
async fn forward_output<R>(reader: R, stream: &'static str, tail: Option<LogTail>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if let Some(ref tail) = tail {
                    tail.push(line);
                }
                info!(target: "backend", stream, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream, error = %e, "Backend output stream closed with error");
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Term,
    Kill,
}

impl CleanupFailure {
    fn is_already_gone(&self) -> bool {
        match self {
            CleanupFailure::Signal { source, .. } => {
                #[cfg(unix)]
                {
                    source.raw_os_error() == Some(libc::ESRCH)
                }
                #[cfg(not(unix))]
                {
                    let _ = source;
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) -> Result<(), CleanupFailure> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // pgid 0 would address our own group
    if pgid == 0 {
        return Ok(());
    }
    let result = unsafe { libc::killpg(pgid as libc::pid_t, sig) };
    if result != 0 {
        return Err(CleanupFailure::Signal {
            pid: pgid as i32,
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: Signal) -> Result<(), CleanupFailure> {
    Ok(())
}

/// Find processes whose argument list contains `pattern` as a contiguous
/// run of whole arguments.
///
/// Reads `<proc_root>/<pid>/cmdline` for every numeric entry. Entries that
/// vanish or cannot be read are skipped; pids in `exclude` are never
/// returned.
pub fn find_matching_pids(
    proc_root: &Path,
    pattern: &[String],
    exclude: &[u32],
) -> std::io::Result<Vec<u32>> {
    let mut pids = Vec::new();
    if pattern.is_empty() {
        return Ok(pids);
    }

    for entry in std::fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if exclude.contains(&pid) {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let argv = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>();
        if argv_matches(&argv, pattern) {
            pids.push(pid);
        }
    }

    pids.sort_unstable();
    Ok(pids)
}

/// The program word also matches by file name, so `php` finds a process
/// started as `/usr/bin/php`
fn argv_matches<S: AsRef<str>>(argv: &[S], pattern: &[String]) -> bool {
    if pattern.is_empty() || argv.len() < pattern.len() {
        return false;
    }
    argv.windows(pattern.len()).enumerate().any(|(start, window)| {
        window.iter().zip(pattern).enumerate().all(|(i, (arg, want))| {
            let arg = arg.as_ref();
            arg == want.as_str()
                || (start == 0
                    && i == 0
                    && Path::new(arg).file_name() == Some(OsStr::new(want.as_str())))
        })
    })
}

#[cfg(target_os = "linux")]
async fn terminate_matching(pattern: Vec<String>) -> usize {
    let own_pid = std::process::id();
    let scan = tokio::task::spawn_blocking(move || {
        find_matching_pids(Path::new("/proc"), &pattern, &[own_pid])
    })
    .await;

    let pids = match scan {
        Ok(Ok(pids)) => pids,
        Ok(Err(e)) => {
            warn!(error = %CleanupFailure::Scan(e), "Stale process cleanup skipped");
            return 0;
        }
        Err(e) => {
            warn!(error = %e, "Stale process scan task failed");
            return 0;
        }
    };

    let own_group = unsafe { libc::getpgrp() };
    let mut signaled = 0;
    for pid in pids {
        let raw = pid as libc::pid_t;
        // Leaders of their own group (earlier backends) take their
        // children with them
        let is_leader = unsafe { libc::getpgid(raw) } == raw && raw != own_group;
        let result = if is_leader {
            unsafe { libc::killpg(raw, libc::SIGTERM) }
        } else {
            unsafe { libc::kill(raw, libc::SIGTERM) }
        };
        if result == 0 {
            info!(pid, group = is_leader, "Sent SIGTERM to stale backend");
            signaled += 1;
        } else {
            let failure = CleanupFailure::Signal {
                pid: raw,
                source: std::io::Error::last_os_error(),
            };
            warn!(error = %failure, "Failed to terminate stale backend");
        }
    }
    signaled
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn terminate_matching(pattern: Vec<String>) -> usize {
    if pattern.is_empty() {
        return 0;
    }
    // pkill matches a regex against the joined command line; anchor the
    // pattern on argument boundaries
    let regex = format!("(^| ){}( |$)", regex_escape(&pattern.join(" ")));
    match Command::new("pkill").args(["-f", &regex]).status().await {
        // pkill exits 0 when something matched and 1 when nothing did
        Ok(status) if status.success() => 1,
        Ok(status) => {
            debug!(?status, "No stale backend processes matched");
            0
        }
        Err(source) => {
            let failure = CleanupFailure::Exec {
                program: "pkill",
                source,
            };
            warn!(error = %failure, "Stale process cleanup skipped");
            0
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn regex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(not(unix))]
async fn terminate_matching(_pattern: Vec<String>) -> usize {
    debug!("Stale process cleanup is not supported on this platform");
    0
}
