//! # Process Runner
//!
//! Spawns a validated [`CommandSpec`] inside its workspace with a scrubbed
//! environment, drains its output under a size cap, and enforces the
//! wall-clock timeout. Every outcome after a successful validation is an
//! [`ExecutionResult`]; nothing here returns an error.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use warden_common::limits::clamp_timeout;
use warden_sandbox::{PlatformSandbox, ProcessHandle, SandboxBackend};

use crate::config::{SandboxConfig, DEFAULT_KILL_GRACE_MS, DEFAULT_MAX_OUTPUT_SIZE};
use crate::monitor::{CancelToken, ResourceLimits, ResourceMonitor, TerminationReason};
use crate::policy::CommandSpec;
use crate::workspace::Workspace;

/// Appended to stdout/stderr when the capture cap was hit.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

#[cfg(unix)]
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const WAIT_POLL: Duration = Duration::from_millis(10);
/// Time the readers get to drain buffered output after the tree is gone.
const DRAIN_SLACK: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8 * 1024;

const PASSTHROUGH_VARS: &[&str] = &["LANG", "LC_ALL", "LC_CTYPE", "TZ", "TERM", "RUSTUP_HOME"];

#[cfg(windows)]
const WINDOWS_PASSTHROUGH_VARS: &[&str] = &["SystemRoot", "SYSTEMROOT", "ComSpec", "COMSPEC", "PATHEXT"];

static ENV_KEY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").ok());

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
    pub timed_out: bool,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl ExecutionResult {
    /// Result for a command that never got to run.
    pub fn failure<C: Into<String>, M: Into<String>>(command: C, message: M, elapsed: Duration) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
            duration_seconds: elapsed.as_secs_f64(),
            timed_out: false,
            truncated: false,
            termination: None,
            command: command.into(),
            pid: None,
        }
    }

    fn push_notice(&mut self, notice: &str) {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(notice);
    }
}

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
    /// Enable the resource watchdog for this run.
    pub strict_limits: bool,
    pub limits: ResourceLimits,
    /// Hard address-space cap applied by the platform backend.
    pub hard_memory_limit: Option<u64>,
    pub cancel: Option<CancelToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_SIZE,
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            strict_limits: false,
            limits: ResourceLimits::default(),
            hard_memory_limit: None,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            max_output_bytes: config.max_output_size.max(1),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            strict_limits: config.resources.strict_limits,
            limits: ResourceLimits::from(&config.resources),
            hard_memory_limit: config.resources.hard_memory_limit_bytes,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_timeout_secs: u64,
}

enum WaitOutcome {
    Exited(ExitStatus),
    Stopped(TerminationReason, Option<ExitStatus>),
    WaitFailed(io::Error),
}

impl ProcessRunner {
    pub fn new(max_timeout_secs: u64) -> Self {
        Self { max_timeout_secs }
    }

    pub fn run(&self, spec: &CommandSpec, workspace: &Workspace, opts: &RunOptions) -> ExecutionResult {
        let started = Instant::now();
        let root = workspace.root_path.as_path();
        let timeout_secs = clamp_timeout(spec.timeout_secs(), self.max_timeout_secs);

        let cwd = spec.cwd().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
        if !cwd.is_dir() {
            return ExecutionResult::failure(
                spec.raw(),
                format!("Working directory not found: {}", cwd.display()),
                started.elapsed(),
            );
        }

        let env = match build_env(root, &cwd, spec.env_overrides()) {
            Ok(env) => env,
            Err(err) => {
                return ExecutionResult::failure(
                    spec.raw(),
                    format!("failed to prepare sandbox environment: {}", err),
                    started.elapsed(),
                )
            }
        };

        let mut cmd = Command::new(program_path(root, spec.program()));
        cmd.args(&spec.argv()[1..])
            .env_clear()
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::null());
        if spec.capture_output() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut backend = match PlatformSandbox::new() {
            Ok(backend) => backend,
            Err(err) => {
                return ExecutionResult::failure(
                    spec.raw(),
                    format!("sandbox backend unavailable: {}", err),
                    started.elapsed(),
                )
            }
        };
        if let Some(bytes) = opts.hard_memory_limit {
            if let Err(err) = backend.set_memory_limit(bytes) {
                warn!("failed to apply memory limit of {} bytes: {}", bytes, err);
            }
        }

        let mut child = match backend.spawn(cmd) {
            Ok(child) => child,
            Err(err) => {
                warn!(target: "warden", "spawn failed | command={:?} error={}", spec.raw(), err);
                return ExecutionResult::failure(
                    spec.raw(),
                    format!("failed to spawn '{}': {}", spec.program(), err),
                    started.elapsed(),
                );
            }
        };

        let pid = child.id();
        let group = child.group();
        info!(
            target: "warden",
            "command spawned | pid={} timeout_secs={} cwd={} command={:?}",
            pid,
            timeout_secs,
            cwd.display(),
            spec.raw()
        );

        let stdout_reader = child
            .take_stdout()
            .map(|stream| spawn_reader(stream, opts.max_output_bytes));
        let stderr_reader = child
            .take_stderr()
            .map(|stream| spawn_reader(stream, opts.max_output_bytes));

        let monitor_cancel = CancelToken::new();
        let monitor = opts.strict_limits.then(|| {
            ResourceMonitor::new(opts.limits.clone()).spawn(group.clone(), monitor_cancel.clone())
        });

        let deadline = started + Duration::from_secs(timeout_secs);
        let outcome = loop {
            match child.try_wait() {
                Ok(Some(status)) => break WaitOutcome::Exited(status),
                Ok(None) => {}
                Err(err) => break WaitOutcome::WaitFailed(err),
            }

            let stop = if opts.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                Some(TerminationReason::Cancelled)
            } else if Instant::now() >= deadline {
                Some(TerminationReason::Timeout { timeout_secs })
            } else {
                None
            };

            if let Some(reason) = stop {
                debug!("stopping pid {}: {}", pid, reason);
                if let Err(err) = group.shutdown(opts.kill_grace) {
                    warn!("failed to terminate process group {}: {}", pid, err);
                }
                break WaitOutcome::Stopped(reason, child.wait().ok());
            }

            thread::sleep(WAIT_POLL);
        };

        monitor_cancel.cancel();
        let resource_stop = monitor.and_then(|handle| handle.join());

        // Whatever the leader left behind goes with it, including members
        // that moved to another session.
        if let Err(err) = group.kill() {
            debug!("post-run cleanup of group {} failed: {}", pid, err);
        }

        // Pipes still open at the deadline belong to a member the sweep could
        // not see. Try once more, then stop waiting for them.
        let readers = [&stdout_reader, &stderr_reader];
        let outlived = !await_readers(&readers, deadline.max(Instant::now() + DRAIN_SLACK));
        if outlived {
            if let Err(err) = group.kill() {
                debug!("second cleanup of group {} failed: {}", pid, err);
            }
            if !await_readers(&readers, Instant::now() + opts.kill_grace) {
                warn!(target: "warden", "output pipes still held after cleanup | pid={}", pid);
            }
        }

        let (stdout, stdout_truncated) = collect_output(stdout_reader, opts.max_output_bytes);
        let (stderr, stderr_truncated) = collect_output(stderr_reader, opts.max_output_bytes);

        let mut result = ExecutionResult {
            success: false,
            exit_code: None,
            stdout,
            stderr,
            duration_seconds: 0.0,
            timed_out: false,
            truncated: stdout_truncated || stderr_truncated,
            termination: None,
            command: spec.raw().to_string(),
            pid: Some(pid),
        };

        match outcome {
            WaitOutcome::Exited(status) => {
                result.exit_code = status.code();
                result.success = status.success() && resource_stop.is_none() && !outlived;
                if let Some(reason) = resource_stop {
                    result.push_notice(&reason.to_string());
                    result.termination = Some(reason);
                } else if outlived {
                    let reason = TerminationReason::Timeout { timeout_secs };
                    result.timed_out = true;
                    result.push_notice(&reason.to_string());
                    result.termination = Some(reason);
                }
            }
            WaitOutcome::Stopped(reason, status) => {
                result.exit_code = status.and_then(|s| s.code());
                result.timed_out = true;
                result.push_notice(&reason.to_string());
                result.termination = Some(reason);
            }
            WaitOutcome::WaitFailed(err) => {
                result.push_notice(&format!("failed to wait for process: {}", err));
            }
        }

        result.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            target: "warden",
            "command completed | pid={} exit_code={:?} success={} timed_out={} truncated={} duration_ms={} stdout_len={} stderr_len={}",
            pid,
            result.exit_code,
            result.success,
            result.timed_out,
            result.truncated,
            started.elapsed().as_millis(),
            result.stdout.len(),
            result.stderr.len()
        );
        result
    }
}

/// Executables given with a separator are relative to the workspace root.
fn program_path(root: &Path, program: &str) -> PathBuf {
    if program.contains('/') || program.contains('\\') {
        root.join(program)
    } else {
        PathBuf::from(program)
    }
}

/// Build the child environment from scratch.
pub fn build_env(
    root: &Path,
    cwd: &Path,
    overrides: &BTreeMap<String, String>,
) -> io::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();

    for var in PASSTHROUGH_VARS {
        if let Ok(val) = std::env::var(var) {
            env.insert(var.to_string(), val);
        }
    }

    #[cfg(unix)]
    env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
    #[cfg(windows)]
    {
        for var in WINDOWS_PASSTHROUGH_VARS {
            if let Ok(val) = std::env::var(var) {
                env.insert(var.to_string(), val);
            }
        }
        let path = std::env::var("PATH")
            .unwrap_or_else(|_| r"C:\Windows\System32;C:\Windows".to_string());
        env.insert("PATH".to_string(), path);
    }

    let home = root.join(".home");
    let tmp = root.join(".tmp");
    create_private_dir(&home)?;
    create_private_dir(&tmp)?;

    let in_home = |rel: &str| home.join(rel).to_string_lossy().into_owned();
    env.insert("HOME".to_string(), home.to_string_lossy().into_owned());
    env.insert("TMPDIR".to_string(), tmp.to_string_lossy().into_owned());
    #[cfg(windows)]
    {
        env.insert("TEMP".to_string(), tmp.to_string_lossy().into_owned());
        env.insert("TMP".to_string(), tmp.to_string_lossy().into_owned());
        env.insert("USERPROFILE".to_string(), home.to_string_lossy().into_owned());
    }
    env.insert("PWD".to_string(), cwd.to_string_lossy().into_owned());
    env.insert("CARGO_HOME".to_string(), in_home(".cargo"));
    env.insert("npm_config_cache".to_string(), in_home(".npm"));
    env.insert("PIP_CACHE_DIR".to_string(), in_home(".cache/pip"));
    env.insert("GOPATH".to_string(), in_home("go"));
    env.insert("GOCACHE".to_string(), in_home(".cache/go-build"));
    env.insert("PYTHONUSERBASE".to_string(), in_home(".local"));
    env.insert("GRADLE_USER_HOME".to_string(), in_home(".gradle"));

    for (key, value) in overrides {
        if !is_acceptable_override(key) {
            debug!("dropping environment override {}", key);
            continue;
        }
        env.insert(key.clone(), value.clone());
    }

    Ok(env)
}

fn is_acceptable_override(key: &str) -> bool {
    let well_formed = ENV_KEY.as_ref().is_some_and(|re| re.is_match(key));
    well_formed
        && key != "PATH"
        && key != "HOME"
        && !key.starts_with("LD_")
        && !key.starts_with("DYLD_")
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .mode(0o700)
            .recursive(true)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Capture shared with its reader thread, so a reader stuck on a pipe held
/// open by a stray process can be abandoned without losing what it read.
struct OutputReader {
    captured: Arc<Mutex<Captured>>,
    handle: JoinHandle<()>,
}

impl OutputReader {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Drain `stream` to EOF, keeping at most `cap` bytes. Reading continues past
/// the cap so the child never blocks on a full pipe.
fn spawn_reader<R: Read + Send + 'static>(mut stream: R, cap: usize) -> OutputReader {
    let captured = Arc::new(Mutex::new(Captured::default()));
    let sink = Arc::clone(&captured);
    let handle = thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
            let room = cap.saturating_sub(captured.bytes.len());
            if n > room {
                captured.truncated = true;
            }
            captured.bytes.extend_from_slice(&buf[..n.min(room)]);
        }
    });
    OutputReader { captured, handle }
}

/// Wait until every reader hit EOF or `deadline` passed. True when all done.
fn await_readers(readers: &[&Option<OutputReader>], deadline: Instant) -> bool {
    loop {
        let done = readers
            .iter()
            .all(|reader| reader.as_ref().map_or(true, OutputReader::is_finished));
        if done {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(WAIT_POLL);
    }
}

fn collect_output(reader: Option<OutputReader>, cap: usize) -> (String, bool) {
    let Some(reader) = reader else {
        return (String::new(), false);
    };
    if reader.is_finished() && reader.handle.join().is_err() {
        warn!("output reader thread panicked");
    }
    let captured = reader.captured.lock().unwrap_or_else(PoisonError::into_inner);
    let (mut text, truncated) = decode_capped(&captured.bytes, captured.truncated, cap);
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    (text, truncated)
}

/// Decode captured bytes without letting the text grow past `cap` bytes.
///
/// A multi-byte character split by the cap is dropped whole, and invalid
/// bytes widened to U+FFFD are cut back at a character boundary. Returns the
/// text and whether anything was cut.
fn decode_capped(bytes: &[u8], truncated: bool, cap: usize) -> (String, bool) {
    let bytes = if truncated {
        &bytes[..complete_prefix_len(bytes)]
    } else {
        bytes
    };
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= cap {
        return (text, truncated);
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    (text, true)
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let floor = bytes.len().saturating_sub(3);
    for start in (floor..bytes.len()).rev() {
        // Continuation bytes look like 0b10xx_xxxx.
        if bytes[start] & 0xC0 == 0x80 {
            continue;
        }
        return match std::str::from_utf8(&bytes[start..]) {
            Err(err) if err.error_len().is_none() => start,
            _ => bytes.len(),
        };
    }
    bytes.len()
}
