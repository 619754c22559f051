//! Bounded execution of plugin hooks.
//!
//! Every hook runs in a separate OS process. The calling thread acts as the
//! watchdog: it polls the child, enforces the wall-clock timeout and the
//! memory ceiling of the child's whole process group, and checks capability
//! requests the plugin prints on stdout (`@capability <permission>`) against
//! the granted permission set.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Prefix of the stdout line a plugin prints before using a permission.
pub const CAPABILITY_DIRECTIVE: &str = "@capability ";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// A sandboxed operation was stopped or failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxViolation {
    /// Wall-clock timeout exceeded; the process was killed.
    #[error("operation exceeded timeout of {limit:?}")]
    Timeout {
        /// Configured limit.
        limit: Duration,
    },

    /// Resident memory went over the ceiling; the process was killed.
    #[error("memory ceiling exceeded: {observed} bytes resident, limit {limit}")]
    MemoryExceeded {
        /// Configured ceiling in bytes.
        limit: u64,
        /// Observed resident size in bytes.
        observed: u64,
    },

    /// The plugin requested a permission it was not granted.
    #[error("capability not granted: {permission}")]
    CapabilityDenied {
        /// Requested permission.
        permission: String,
    },

    /// The process died abnormally.
    #[error("plugin process crashed: {reason}")]
    Crashed {
        /// Signal or wait failure.
        reason: String,
    },

    /// The hook reported failure through its exit code.
    #[error("plugin exited with status {code}: {stderr}")]
    NonZeroExit {
        /// Exit code.
        code: i32,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// The operation was cancelled by the host.
    #[error("operation cancelled")]
    Cancelled,

    /// The process could not be started.
    #[error("failed to launch plugin process: {0}")]
    Launch(String),
}

/// Limits applied to a single sandboxed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Wall-clock timeout.
    pub timeout: Duration,
    /// Resident memory ceiling in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU time limit in seconds (`RLIMIT_CPU`).
    pub cpu_seconds: Option<u64>,
    /// Open file descriptor limit (`RLIMIT_NOFILE`).
    pub open_files: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            memory_bytes: Some(128 * MIB),
            cpu_seconds: None,
            open_files: None,
        }
    }
}

impl ResourceLimits {
    /// Create default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with no memory, CPU or file ceilings.
    pub fn unlimited(timeout: Duration) -> Self {
        Self {
            timeout,
            memory_bytes: None,
            cpu_seconds: None,
            open_files: None,
        }
    }

    /// Tight limits for untrusted hooks.
    pub fn strict() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            memory_bytes: Some(32 * MIB),
            cpu_seconds: Some(5),
            open_files: Some(64),
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the memory ceiling.
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    /// Set the CPU time limit.
    pub fn with_cpu_seconds(mut self, seconds: u64) -> Self {
        self.cpu_seconds = Some(seconds);
        self
    }

    /// Set the open file limit.
    pub fn with_open_files(mut self, count: u64) -> Self {
        self.open_files = Some(count);
        self
    }
}

/// Process sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// How often the watchdog polls the child.
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub grace_period: Duration,
    /// Host environment variables passed through to the plugin.
    pub inherit_env: Vec<String>,
    /// Working directory for plugin processes.
    pub work_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            grace_period: Duration::from_millis(500),
            inherit_env: vec!["PATH".to_string()],
            work_dir: None,
        }
    }
}

impl SandboxConfig {
    /// Create default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the cancellation grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Pass a host environment variable through.
    pub fn with_inherited_env(mut self, name: impl Into<String>) -> Self {
        self.inherit_env.push(name.into());
        self
    }

    /// Set the working directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}

/// Cooperative cancellation flag shared between the host and a running operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One operation to run inside the sandbox.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Plugin name.
    pub plugin: &'a str,
    /// Hook or entry point name; appended to the command.
    pub operation: &'a str,
    /// Launcher command.
    pub command: &'a [String],
    /// Permissions honored at the boundary.
    pub granted: &'a BTreeSet<String>,
    /// Bytes written to the plugin's stdin.
    pub input: &'a [u8],
    /// Cancellation flag checked by the watchdog.
    pub cancel: Option<&'a CancelToken>,
    /// Plugin configuration, exported as `PLUGIN_CONFIG`.
    pub config: Option<&'a BTreeMap<String, String>>,
}

/// Result of a successful sandboxed operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookOutput {
    /// Stdout without capability directives.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Granted permissions the plugin announced.
    pub capabilities_used: Vec<String>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Highest resident size observed, when sampled.
    pub peak_memory_bytes: Option<u64>,
}

/// An isolation boundary for plugin operations.
///
/// Implementations must always return: a hung, crashing or misbehaving plugin
/// surfaces as a [`SandboxViolation`], never as a fault in the host.
pub trait Sandbox: Send + Sync {
    /// Run one operation under the given limits.
    fn run(
        &self,
        invocation: &Invocation<'_>,
        limits: &ResourceLimits,
    ) -> Result<HookOutput, SandboxViolation>;
}

/// Sandbox that runs each operation in its own process group.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    /// Create a process sandbox.
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn spawn(
        &self,
        invocation: &Invocation<'_>,
        limits: &ResourceLimits,
    ) -> Result<Child, SandboxViolation> {
        let (program, args) = invocation
            .command
            .split_first()
            .ok_or_else(|| SandboxViolation::Launch("empty launcher command".into()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(invocation.operation)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for name in &self.config.inherit_env {
            if let Some(value) = std::env::var_os(name) {
                command.env(name, value);
            }
        }
        let granted: Vec<&str> = invocation.granted.iter().map(String::as_str).collect();
        command
            .env("PLUGIN_NAME", invocation.plugin)
            .env("PLUGIN_HOOK", invocation.operation)
            .env("PLUGIN_PERMISSIONS", granted.join(","));
        if let Some(config) = invocation.config {
            command.env("PLUGIN_CONFIG", encode_config(config));
        }

        if let Some(dir) = &self.config.work_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        confine(&mut command, limits);
        #[cfg(not(unix))]
        let _ = limits;

        command
            .spawn()
            .map_err(|e| SandboxViolation::Launch(format!("{}: {}", program, e)))
    }

    fn terminate_gracefully(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            signal_group(child, libc::SIGTERM);
            let deadline = Instant::now() + self.config.grace_period;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = child.try_wait() {
                    kill_group(child);
                    return;
                }
                thread::sleep(self.config.poll_interval);
            }
            tracing::debug!(pid = child.id(), "grace period elapsed, escalating to SIGKILL");
        }
        kill_group(child);
    }
}

impl Sandbox for ProcessSandbox {
    fn run(
        &self,
        invocation: &Invocation<'_>,
        limits: &ResourceLimits,
    ) -> Result<HookOutput, SandboxViolation> {
        let started = Instant::now();
        let mut child = self.spawn(invocation, limits)?;
        let pid = child.id();
        tracing::debug!(
            plugin = invocation.plugin,
            operation = invocation.operation,
            pid,
            "sandbox process started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            let input = invocation.input.to_vec();
            thread::spawn(move || {
                // The plugin may exit without reading its input.
                let _ = stdin.write_all(&input);
            });
        }

        let mut stdout = StdoutPump::start(child.stdout.take());
        let stderr = spawn_collector(child.stderr.take());
        let mut peak_memory: Option<u64> = None;

        let outcome: Result<ExitStatus, SandboxViolation> = loop {
            if let Err(violation) = stdout.poll(invocation.granted) {
                break Err(violation);
            }

            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(e) => {
                    break Err(SandboxViolation::Crashed {
                        reason: format!("wait failed: {}", e),
                    })
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= limits.timeout {
                break Err(SandboxViolation::Timeout {
                    limit: limits.timeout,
                });
            }

            if invocation.cancel.map_or(false, CancelToken::is_cancelled) {
                self.terminate_gracefully(&mut child);
                break Err(SandboxViolation::Cancelled);
            }

            if let Some(resident) = resident_memory(pid) {
                peak_memory = Some(peak_memory.map_or(resident, |p| p.max(resident)));
                if let Some(limit) = limits.memory_bytes {
                    if resident > limit {
                        break Err(SandboxViolation::MemoryExceeded {
                            limit,
                            observed: resident,
                        });
                    }
                }
            }

            let remaining = limits.timeout.saturating_sub(elapsed);
            thread::sleep(self.config.poll_interval.min(remaining));
        };

        let status = match outcome {
            Ok(status) => status,
            Err(violation) => {
                kill_group(&mut child);
                tracing::warn!(
                    plugin = invocation.plugin,
                    operation = invocation.operation,
                    "sandbox terminated operation: {}",
                    violation
                );
                return Err(violation);
            }
        };

        let stdout_text = stdout.finish(invocation.granted, self.config.grace_period)?;
        let stderr_text = stderr
            .recv_timeout(self.config.grace_period)
            .unwrap_or_default();
        let duration = started.elapsed();

        if status.success() {
            tracing::debug!(
                plugin = invocation.plugin,
                operation = invocation.operation,
                ?duration,
                "sandbox operation completed"
            );
            return Ok(HookOutput {
                stdout: stdout_text,
                stderr: stderr_text,
                capabilities_used: stdout.used,
                duration,
                peak_memory_bytes: peak_memory,
            });
        }

        Err(match status.code() {
            Some(code) => SandboxViolation::NonZeroExit {
                code,
                stderr: stderr_text.trim().to_string(),
            },
            None => SandboxViolation::Crashed {
                reason: describe_signal(&status),
            },
        })
    }
}

enum StdoutEvent {
    Capability(String),
    Closed(String),
}

/// Reads plugin stdout on a separate thread, splitting capability directives
/// from ordinary output.
struct StdoutPump {
    events: Option<Receiver<StdoutEvent>>,
    output: Option<String>,
    used: Vec<String>,
}

impl StdoutPump {
    fn start<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let events = stream.map(|stream| {
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || pump_stdout(stream, tx));
            rx
        });
        Self {
            events,
            output: None,
            used: Vec::new(),
        }
    }

    fn handle(&mut self, event: StdoutEvent, granted: &BTreeSet<String>) -> Result<(), SandboxViolation> {
        match event {
            StdoutEvent::Capability(permission) => {
                if !granted.contains(&permission) {
                    return Err(SandboxViolation::CapabilityDenied { permission });
                }
                if !self.used.contains(&permission) {
                    self.used.push(permission);
                }
            }
            StdoutEvent::Closed(output) => self.output = Some(output),
        }
        Ok(())
    }

    fn poll(&mut self, granted: &BTreeSet<String>) -> Result<(), SandboxViolation> {
        loop {
            let event = match self.events.as_ref().map(Receiver::try_recv) {
                Some(Ok(event)) => event,
                Some(Err(TryRecvError::Empty)) | None => return Ok(()),
                Some(Err(TryRecvError::Disconnected)) => {
                    self.events = None;
                    return Ok(());
                }
            };
            self.handle(event, granted)?;
        }
    }

    fn finish(&mut self, granted: &BTreeSet<String>, wait: Duration) -> Result<String, SandboxViolation> {
        let deadline = Instant::now() + wait;
        while self.output.is_none() {
            let Some(events) = self.events.as_ref() else {
                break;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) => self.handle(event, granted)?,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(self.output.take().unwrap_or_default())
    }
}

fn pump_stdout<R: Read>(stream: R, tx: Sender<StdoutEvent>) {
    let mut reader = BufReader::new(stream);
    let mut output = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                match text.trim_end().strip_prefix(CAPABILITY_DIRECTIVE) {
                    Some(permission) => {
                        if tx
                            .send(StdoutEvent::Capability(permission.trim().to_string()))
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => output.push_str(&text),
                }
            }
        }
    }
    let _ = tx.send(StdoutEvent::Closed(output));
}

fn spawn_collector<R: Read + Send + 'static>(stream: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut stream) = stream {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
    }
    rx
}

#[cfg(unix)]
fn confine(command: &mut Command, limits: &ResourceLimits) {
    use std::os::unix::process::CommandExt;

    let cpu = limits.cpu_seconds;
    let files = limits.open_files;

    // SAFETY: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            // Own process group so the whole tree can be signalled at once.
            if libc::setpgid(0, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(cpu) = cpu {
                let rlim = libc::rlimit {
                    rlim_cur: cpu as libc::rlim_t,
                    rlim_max: cpu as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlim) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(files) = files {
                let rlim = libc::rlimit {
                    rlim_cur: files as libc::rlim_t,
                    rlim_max: files as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
}

fn describe_signal(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    format!("abnormal exit: {}", status)
}

/// `key=value` lines, sorted by key.
pub(crate) fn encode_config(config: &BTreeMap<String, String>) -> String {
    config
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect()
}

/// Resident set size of a whole process group in bytes.
///
/// The leader's pid is the group id, so anything the plugin forks is
/// counted against the same ceiling.
#[cfg(target_os = "linux")]
fn resident_memory(pgid: u32) -> Option<u64> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let mut total: Option<u64> = None;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid != pgid && process_group(pid) != Some(pgid) {
            continue;
        }
        if let Some(rss) = process_rss(pid) {
            total = Some(total.unwrap_or(0) + rss);
        }
    }
    total
}

#[cfg(target_os = "linux")]
fn process_group(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(2)?.parse().ok()
}

#[cfg(target_os = "linux")]
fn process_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kib| kib * KIB)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory(_pgid: u32) -> Option<u64> {
    None
}
