//! Shell execution service with full output capture and robust cancellation.
//!
//! Runs one shell command per invocation; the service holds no state across
//! calls and each invocation owns its process exclusively. Output is decoded
//! incrementally using the encoding sniffed from the first bytes (UTF-8 when
//! the prefix is valid UTF-8, with malformed sequences replaced), ANSI
//! escapes stripped; once the first chunk of combined output looks binary,
//! raw text events stop and byte-count progress events take over while the
//! full raw output is still buffered for the final result. Cancellation terminates the whole process group with a short
//! grace period before escalating to a forceful kill.
//!
//! A non-zero exit code is a normal, reportable result. Only failure to spawn
//! the process at all is surfaced through the result's `error` field.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Combined-output prefix inspected for binary content.
const BINARY_SNIFF_BYTES: usize = 4096;
/// Time between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE_PERIOD: Duration = Duration::from_millis(200);
/// Cap on waiting for reader tasks once the child has exited; grandchildren
/// holding the pipes open must not hang the whole session.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellStream {
    Stdout,
    Stderr,
}

/// Incremental output notifications delivered to the caller's callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellOutputEvent {
    Data { stream: ShellStream, chunk: String },
    BinaryDetected,
    BinaryProgress { bytes_received: u64 },
}

pub type OnShellOutput = Arc<dyn Fn(ShellOutputEvent) + Send + Sync>;

/// Produced exactly once per spawned process, after it has fully exited or
/// been force-killed.
#[derive(Debug, Clone)]
pub struct ShellExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Combined raw output, decoded leniently (binary output included).
    pub output: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub aborted: bool,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

impl ShellExecutionResult {
    fn spawn_failure(message: String) -> Self {
        ShellExecutionResult {
            stdout: String::new(),
            stderr: String::new(),
            output: String::new(),
            exit_code: None,
            signal: None,
            aborted: false,
            pid: None,
            error: Some(message),
        }
    }
}

/// Handle returned as soon as the process is spawned: the pid is available
/// immediately, the full result is deferred until exit.
pub struct ShellExecutionHandle {
    pub pid: Option<u32>,
    result: JoinHandle<ShellExecutionResult>,
}

impl ShellExecutionHandle {
    pub async fn result(self) -> ShellExecutionResult {
        match self.result.await {
            Ok(result) => result,
            Err(e) => ShellExecutionResult::spawn_failure(format!(
                "execution task failed: {}",
                e
            )),
        }
    }
}

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap())
}

fn strip_ansi(text: &str) -> String {
    ansi_pattern().replace_all(text, "").into_owned()
}

fn looks_binary(prefix: &[u8]) -> bool {
    prefix.contains(&0u8)
}

/// Guess the output encoding from the sniffed prefix. Valid UTF-8 stays
/// UTF-8; legacy single-byte output (e.g. Latin-1) is detected and decoded
/// accordingly, with malformed sequences replaced rather than erroring.
fn detect_encoding(prefix: &[u8]) -> &'static encoding_rs::Encoding {
    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(prefix, true);
    detector.guess(None, true)
}

/// Shared sniffing state across the stdout/stderr readers.
struct OutputState {
    sniff: Vec<u8>,
    combined: Vec<u8>,
    binary: bool,
    binary_announced: bool,
}

impl OutputState {
    fn new() -> Self {
        OutputState {
            sniff: Vec::with_capacity(BINARY_SNIFF_BYTES),
            combined: Vec::new(),
            binary: false,
            binary_announced: false,
        }
    }
}

pub struct ShellExecutionService;

impl ShellExecutionService {
    /// Spawn `command` under the host shell in `cwd`. Output events are
    /// delivered through `on_output` as they arrive; the final result is
    /// available through the returned handle.
    pub fn execute(
        command: &str,
        cwd: &Path,
        on_output: Option<OnShellOutput>,
        cancel: CancellationToken,
    ) -> ShellExecutionHandle {
        let mut cmd = host_shell_command(command);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn '{}': {}", command, e);
                log::error!("{}", message);
                return ShellExecutionHandle {
                    pid: None,
                    result: tokio::spawn(async move {
                        ShellExecutionResult::spawn_failure(message)
                    }),
                };
            }
        };

        let pid = child.id();
        let result = tokio::spawn(supervise(child_take(&mut child), child, pid, on_output, cancel));
        ShellExecutionHandle { pid, result }
    }
}

type ChildPipes = (
    Option<tokio::process::ChildStdout>,
    Option<tokio::process::ChildStderr>,
);

fn child_take(child: &mut Child) -> ChildPipes {
    (child.stdout.take(), child.stderr.take())
}

async fn supervise(
    pipes: ChildPipes,
    mut child: Child,
    pid: Option<u32>,
    on_output: Option<OnShellOutput>,
    cancel: CancellationToken,
) -> ShellExecutionResult {
    let state = Arc::new(Mutex::new(OutputState::new()));

    let (stdout_pipe, stderr_pipe) = pipes;
    let mut stdout_task = stdout_pipe.map(|pipe| {
        tokio::spawn(read_stream(
            BufReader::new(pipe),
            ShellStream::Stdout,
            state.clone(),
            on_output.clone(),
        ))
    });
    let mut stderr_task = stderr_pipe.map(|pipe| {
        tokio::spawn(read_stream(
            BufReader::new(pipe),
            ShellStream::Stderr,
            state.clone(),
            on_output.clone(),
        ))
    });

    let (status, aborted) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        _ = cancel.cancelled() => {
            let status = terminate_process_tree(&mut child).await;
            (status, true)
        }
    };

    let stdout = drain_reader(&mut stdout_task).await;
    let stderr = drain_reader(&mut stderr_task).await;

    let (combined, sniff, binary) = {
        let state = state.lock().unwrap();
        (state.combined.clone(), state.sniff.clone(), state.binary)
    };

    let decode = |bytes: &[u8]| -> String {
        if binary {
            return String::from_utf8_lossy(bytes).into_owned();
        }
        let (text, _, _) = detect_encoding(&sniff).decode(bytes);
        strip_ansi(&text)
    };

    let (exit_code, signal) = match &status {
        Some(status) => (status.code(), unix_signal(status)),
        None => (None, None),
    };

    ShellExecutionResult {
        stdout: decode(&stdout),
        stderr: decode(&stderr),
        output: decode(&combined),
        exit_code,
        signal,
        aborted,
        pid,
        error: None,
    }
}

async fn drain_reader(task: &mut Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = task.as_mut() else {
        return Vec::new();
    };
    match tokio::time::timeout(IO_DRAIN_TIMEOUT, &mut *handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            log::warn!("output reader task failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: ShellStream,
    state: Arc<Mutex<OutputState>>,
    on_output: Option<OnShellOutput>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let chunk = &tmp[..n];
        buf.extend_from_slice(chunk);

        let event = {
            let mut state = state.lock().unwrap();
            state.combined.extend_from_slice(chunk);
            if !state.binary && state.sniff.len() < BINARY_SNIFF_BYTES {
                let room = BINARY_SNIFF_BYTES - state.sniff.len();
                state.sniff.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if looks_binary(&state.sniff) {
                    state.binary = true;
                }
            }
            if state.binary {
                if !state.binary_announced {
                    state.binary_announced = true;
                    Some(ShellOutputEvent::BinaryDetected)
                } else {
                    Some(ShellOutputEvent::BinaryProgress {
                        bytes_received: state.combined.len() as u64,
                    })
                }
            } else {
                let (text, _, _) = detect_encoding(&state.sniff).decode(chunk);
                Some(ShellOutputEvent::Data {
                    stream,
                    chunk: strip_ansi(&text),
                })
            }
        };

        if let (Some(on_output), Some(event)) = (&on_output, event) {
            on_output(event);
        }
    }
    buf
}

fn host_shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/c").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Graceful-then-forceful termination of the child's entire process tree.
/// Returns the exit status if the child was reaped.
async fn terminate_process_tree(child: &mut Child) -> Option<std::process::ExitStatus> {
    signal_tree_graceful(child);
    match tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            signal_tree_forceful(child);
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn signal_tree_graceful(child: &Child) {
    signal_process_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn signal_tree_forceful(child: &Child) {
    signal_process_group(child, libc::SIGKILL);
}

#[cfg(unix)]
fn signal_process_group(child: &Child, signal: i32) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = pid as libc::pid_t;
    let pgid = unsafe { libc::getpgid(pid) };
    if pgid == -1 {
        return;
    }
    let result = unsafe { libc::killpg(pgid, signal) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("killpg({}, {}) failed: {}", pgid, signal, err);
        }
    }
}

#[cfg(not(unix))]
fn signal_tree_graceful(child: &Child) {
    taskkill(child, false);
}

#[cfg(not(unix))]
fn signal_tree_forceful(child: &Child) {
    taskkill(child, true);
}

#[cfg(not(unix))]
fn taskkill(child: &Child, force: bool) {
    let Some(pid) = child.id() else {
        return;
    };
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID")
        .arg(pid.to_string())
        .arg("/T")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if force {
        cmd.arg("/F");
    }
    // Fire and forget: the caller's wait-with-timeout observes the effect.
    match cmd.spawn() {
        Ok(mut killer) => {
            tokio::spawn(async move {
                let _ = killer.wait().await;
            });
        }
        Err(e) => log::warn!("taskkill for pid {} failed: {}", pid, e),
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Placeholder path used by callers that have no working directory of their
/// own; resolves to the process cwd.
pub fn default_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
