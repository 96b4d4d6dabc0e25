//! The process primitive.
//!
//! A [`Process`] is one OS child built from a [`ProcessConfig`]: the command
//! line is templated once at construction, rlimits are validated, and the
//! child is spawned with the configured stream layout.
//!
//! # Identity
//!
//! Processes are ordered by pid, and a process is only ever equal to itself.
//! Two distinct instances that happen to share a pid (pid reuse) are not
//! comparable at all.
//!
//! # Blocking
//!
//! [`Process::stop`] and [`Process::wait`] block the calling thread. Async
//! callers should run them on a blocking pool.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::ptr;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::rlimit::RlimitSet;
use crate::template::{split_words, substitute, TemplateContext};

/// Shell used when `shell = true`.
pub const SHELL: &str = "/bin/sh";

/// Poll interval while waiting for a signalled child to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Maximum number of parents walked by [`Process::is_child`].
const MAX_ANCESTRY_DEPTH: usize = 64;

// ============================================================================
// Configuration
// ============================================================================

/// Arguments appended to the command, either as one shell-like string or as
/// a sequence of words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Args {
    Line(String),
    List(Vec<String>),
}

impl Default for Args {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl From<&str> for Args {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for Args {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for Args {
    fn from(words: Vec<String>) -> Self {
        Self::List(words)
    }
}

fn default_true() -> bool {
    true
}

/// How to build and spawn a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Command template (program plus optional leading arguments)
    pub cmd: String,

    /// Argument template
    #[serde(default)]
    pub args: Args,

    /// Run the resolved command line through `/bin/sh -c`
    #[serde(default)]
    pub shell: bool,

    /// Spawn as soon as the process is constructed
    #[serde(default = "default_true")]
    pub spawn: bool,

    /// Extra environment for the child, also consulted by `$(circus.env.*)`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Limit name -> value, applied as both soft and hard limit
    #[serde(default)]
    pub rlimits: BTreeMap<String, u64>,

    /// Working directory of the child
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub pipe_stdout: bool,

    #[serde(default = "default_true")]
    pub pipe_stderr: bool,

    #[serde(default)]
    pub close_child_stdout: bool,

    #[serde(default)]
    pub close_child_stderr: bool,
}

impl ProcessConfig {
    /// Creates a configuration with default options.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Args::default(),
            shell: false,
            spawn: true,
            env: BTreeMap::new(),
            rlimits: BTreeMap::new(),
            working_dir: None,
            pipe_stdout: true,
            pipe_stderr: true,
            close_child_stdout: false,
            close_child_stderr: false,
        }
    }

    pub fn with_args(mut self, args: impl Into<Args>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_rlimit(mut self, name: impl Into<String>, value: u64) -> Self {
        self.rlimits.insert(name.into(), value);
        self
    }

    pub fn with_shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Sets whether construction spawns the child right away.
    pub fn with_spawn(mut self, spawn: bool) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets `pipe_stdout` / `close_child_stdout`.
    pub fn with_stdout(mut self, pipe: bool, close_child: bool) -> Self {
        self.pipe_stdout = pipe;
        self.close_child_stdout = close_child;
        self
    }

    /// Sets `pipe_stderr` / `close_child_stderr`.
    pub fn with_stderr(mut self, pipe: bool, close_child: bool) -> Self {
        self.pipe_stderr = pipe;
        self.close_child_stderr = close_child;
        self
    }
}

// ============================================================================
// Streams
// ============================================================================

/// Layout of one output stream, from the `pipe_*` and `close_child_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    /// Child writes into a pipe the parent reads
    Capture,
    /// Child writes to /dev/null, parent gets a handle that reads EOF
    Empty,
    /// Child writes to /dev/null, parent gets nothing
    Discard,
    /// Child inherits the daemon's descriptor
    Inherit,
}

impl StreamMode {
    fn new(pipe: bool, close_child: bool) -> Self {
        match (pipe, close_child) {
            (true, false) => Self::Capture,
            (true, true) => Self::Empty,
            (false, true) => Self::Discard,
            (false, false) => Self::Inherit,
        }
    }

    fn child_stdio(self) -> Stdio {
        match self {
            Self::Capture => Stdio::piped(),
            Self::Empty | Self::Discard => Stdio::null(),
            Self::Inherit => Stdio::inherit(),
        }
    }

    /// Handle for the parent once the child exists.
    fn parent_handle(self, pipe: Option<OwnedFd>) -> io::Result<Option<File>> {
        match self {
            Self::Capture => Ok(pipe.map(File::from)),
            Self::Empty => File::open("/dev/null").map(Some),
            Self::Discard | Self::Inherit => Ok(None),
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Not spawned yet
    NotSpawned,
    /// Child is alive
    Running,
    /// Child exited normally with a code
    Exited(i32),
    /// Child was terminated by a signal
    Killed(i32),
}

impl ProcessStatus {
    fn from_exit(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signal)) => Self::Killed(signal),
            (None, None) => Self::Exited(-1),
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Returns true once the child has exited or was killed.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed(_))
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSpawned => write!(f, "not spawned"),
            Self::Running => write!(f, "running"),
            Self::Exited(code) => write!(f, "exited ({code})"),
            Self::Killed(signal) => write!(f, "killed (signal {signal})"),
        }
    }
}

/// Snapshot of a process, as reported by the `stats` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub wid: String,
    pub pid: Option<u32>,
    pub cmdline: String,
    pub status: String,
    /// Seconds since spawn
    pub age: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

// ============================================================================
// Process
// ============================================================================

/// A single supervised OS process.
#[derive(Debug)]
pub struct Process {
    wid: String,
    config: ProcessConfig,
    argv: Vec<String>,
    command_line: String,
    rlimits: RlimitSet,
    child: Option<Child>,
    pid: Option<u32>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    exit: Option<ProcessStatus>,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl Process {
    /// Builds a process, resolving its command line and rlimits.
    ///
    /// Spawns immediately unless `config.spawn` is false.
    pub fn new(wid: impl Into<String>, config: ProcessConfig) -> ProcessResult<Self> {
        let wid = wid.into();
        let (argv, command_line) = resolve_command(&wid, &config)?;
        let rlimits = RlimitSet::parse(&config.rlimits)?;
        let spawn = config.spawn;

        let mut process = Self {
            wid,
            config,
            argv,
            command_line,
            rlimits,
            child: None,
            pid: None,
            started: None,
            started_at: None,
            exit: None,
            stdout: None,
            stderr: None,
        };

        if spawn {
            process.spawn()?;
        }
        Ok(process)
    }

    /// Spawns the child.
    pub fn spawn(&mut self) -> ProcessResult<()> {
        if let (ProcessStatus::Running, Some(pid)) = (self.status(), self.pid) {
            return Err(ProcessError::AlreadySpawned {
                wid: self.wid.clone(),
                pid,
            });
        }

        let mut command = self.build_command()?;
        let stdout_mode = StreamMode::new(self.config.pipe_stdout, self.config.close_child_stdout);
        let stderr_mode = StreamMode::new(self.config.pipe_stderr, self.config.close_child_stderr);
        command
            .stdin(Stdio::null())
            .stdout(stdout_mode.child_stdio())
            .stderr(stderr_mode.child_stdio());

        if !self.rlimits.is_empty() {
            let rlimits = self.rlimits.clone();
            // SAFETY: the hook only calls setrlimit, which is async-signal-safe.
            unsafe {
                command.pre_exec(move || rlimits.apply_all());
            }
        }

        let spawn_error = |source| ProcessError::Spawn {
            cmd: self.command_line.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_error)?;
        let stdout_pipe = child.stdout.take().map(OwnedFd::from);
        let stderr_pipe = child.stderr.take().map(OwnedFd::from);
        let handles = stdout_mode
            .parent_handle(stdout_pipe)
            .and_then(|out| Ok((out, stderr_mode.parent_handle(stderr_pipe)?)));
        let (stdout, stderr) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(spawn_error(e));
            }
        };

        let pid = child.id();
        info!(wid = %self.wid, pid, cmd = %self.command_line, "Process spawned");

        self.child = Some(child);
        self.pid = Some(pid);
        self.started = Some(Instant::now());
        self.started_at = Some(Utc::now());
        self.exit = None;
        self.stdout = stdout;
        self.stderr = stderr;
        Ok(())
    }

    fn build_command(&self) -> ProcessResult<Command> {
        let mut command = if self.config.shell {
            let mut command = Command::new(SHELL);
            command.arg("-c").arg(&self.command_line);
            command
        } else {
            let (program, args) = self
                .argv
                .split_first()
                .ok_or_else(|| ProcessError::EmptyCommand {
                    wid: self.wid.clone(),
                })?;
            let mut command = Command::new(program);
            command.args(args);
            command
        };

        command.envs(&self.config.env);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        Ok(command)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Worker id.
    pub fn wid(&self) -> &str {
        &self.wid
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// OS pid, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Fully resolved argument vector (program first).
    pub fn format_args(&self) -> &[String] {
        &self.argv
    }

    /// Resolved command line, as passed to the shell in shell mode.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Wall-clock spawn time.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time elapsed since spawn, zero before spawn.
    pub fn age(&self) -> Duration {
        self.started.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Parent-side stdout handle, if the stream is piped.
    pub fn stdout(&mut self) -> Option<&mut File> {
        self.stdout.as_mut()
    }

    /// Parent-side stderr handle, if the stream is piped.
    pub fn stderr(&mut self) -> Option<&mut File> {
        self.stderr.as_mut()
    }

    /// Takes ownership of the stdout handle.
    pub fn take_stdout(&mut self) -> Option<File> {
        self.stdout.take()
    }

    /// Takes ownership of the stderr handle.
    pub fn take_stderr(&mut self) -> Option<File> {
        self.stderr.take()
    }

    // ------------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------------

    /// Polls the child without blocking.
    pub fn status(&mut self) -> ProcessStatus {
        if let Some(exit) = self.exit {
            return exit;
        }
        let Some(child) = self.child.as_mut() else {
            return ProcessStatus::NotSpawned;
        };
        match child.try_wait() {
            Ok(Some(status)) => self.record_exit(status),
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                debug!(wid = %self.wid, error = %e, "try_wait failed");
                ProcessStatus::Running
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) -> ProcessStatus {
        let status = ProcessStatus::from_exit(status);
        debug!(wid = %self.wid, pid = ?self.pid, %status, "Process reaped");
        self.exit = Some(status);
        status
    }

    fn running_pid(&mut self) -> ProcessResult<u32> {
        match (self.status(), self.pid) {
            (ProcessStatus::Running, Some(pid)) => Ok(pid),
            _ => Err(ProcessError::NotSpawned {
                wid: self.wid.clone(),
            }),
        }
    }

    /// Sends a signal to the child.
    pub fn send_signal(&mut self, signal: i32) -> ProcessResult<()> {
        let pid = self.running_pid()?;
        let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
            return Err(ProcessError::Signal {
                pid,
                signal,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        };

        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(raw_pid, signal) };
        if rc != 0 {
            return Err(ProcessError::Signal {
                pid,
                signal,
                source: io::Error::last_os_error(),
            });
        }
        debug!(wid = %self.wid, pid, signal, "Signal sent");
        Ok(())
    }

    /// Blocks until the child exits.
    pub fn wait(&mut self) -> ProcessResult<ProcessStatus> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(ProcessStatus::NotSpawned);
        };
        let pid = child.id();
        let status = child
            .wait()
            .map_err(|source| ProcessError::Wait { pid, source })?;
        Ok(self.record_exit(status))
    }

    /// Stops the child: SIGTERM, up to `graceful_timeout` for it to exit,
    /// then SIGKILL. Blocks the calling thread.
    pub fn stop(&mut self, graceful_timeout: Duration) -> ProcessResult<ProcessStatus> {
        if !self.status().is_running() {
            return Ok(self.status());
        }

        if let Err(e) = self.send_signal(libc::SIGTERM) {
            // Raced with the child exiting on its own
            debug!(wid = %self.wid, error = %e, "SIGTERM failed");
        }

        let deadline = Instant::now() + graceful_timeout;
        while Instant::now() < deadline {
            let status = self.status();
            if !status.is_running() {
                info!(wid = %self.wid, pid = ?self.pid, %status, "Process stopped");
                return Ok(status);
            }
            thread::sleep(STOP_POLL_INTERVAL);
        }

        warn!(
            wid = %self.wid,
            pid = ?self.pid,
            timeout_ms = graceful_timeout.as_millis() as u64,
            "Process ignored SIGTERM, killing"
        );
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                debug!(wid = %self.wid, error = %e, "SIGKILL failed");
            }
        }
        self.wait()
    }

    /// Returns true if `pid` descends from this process.
    ///
    /// Walks the parent chain of `pid` through `/proc`. Always false for
    /// pid 0, pid 1, this process's own pid, or before spawn.
    pub fn is_child(&self, pid: u32) -> bool {
        let Some(me) = self.pid else {
            return false;
        };
        if pid <= 1 || pid == me {
            return false;
        }

        let mut current = pid;
        for _ in 0..MAX_ANCESTRY_DEPTH {
            match parent_pid(current) {
                Some(ppid) if ppid == me => return true,
                Some(ppid) if ppid > 1 => current = ppid,
                _ => return false,
            }
        }
        false
    }

    /// Snapshot of this process using an already-refreshed `System`.
    pub fn info(&mut self, system: &System) -> ProcessInfo {
        let (memory_bytes, cpu_percent) = self
            .pid
            .and_then(|pid| system.process(Pid::from_u32(pid)))
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));

        ProcessInfo {
            wid: self.wid.clone(),
            pid: self.pid,
            cmdline: self.command_line.clone(),
            status: self.status().to_string(),
            age: self.age().as_secs_f64(),
            started_at: self.started_at,
            memory_bytes,
            cpu_percent,
        }
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl PartialOrd for Process {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if ptr::eq(self, other) {
            return Some(Ordering::Equal);
        }
        match self.pid.cmp(&other.pid) {
            Ordering::Equal => None,
            ordering => Some(ordering),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolves the argument vector and the shell command line.
fn resolve_command(wid: &str, config: &ProcessConfig) -> ProcessResult<(Vec<String>, String)> {
    let ctx = TemplateContext::new(wid, &config.env);
    let cmd = substitute(&config.cmd, &ctx)?;
    let mut argv = split_words(&cmd)?;

    let args_line = match &config.args {
        Args::Line(line) => {
            let line = substitute(line, &ctx)?;
            argv.extend(split_words(&line)?);
            line
        }
        Args::List(words) => {
            let words = words
                .iter()
                .map(|word| substitute(word, &ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let line = if config.shell {
                words.iter().map(|word| shell_quote(word)).collect::<Vec<_>>().join(" ")
            } else {
                words.join(" ")
            };
            argv.extend(words);
            line
        }
    };

    if argv.is_empty() {
        return Err(ProcessError::EmptyCommand {
            wid: wid.to_string(),
        });
    }

    let command_line = if args_line.is_empty() {
        cmd
    } else {
        format!("{cmd} {args_line}")
    };
    Ok((argv, command_line))
}

/// Quotes `word` for `/bin/sh` so it stays a single argument.
fn shell_quote(word: &str) -> Cow<'_, str> {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=,+@%".contains(&b));
    if safe {
        Cow::Borrowed(word)
    } else {
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Reads the parent pid of `pid` from procfs.
fn parent_pid(pid: u32) -> Option<u32> {
    let raw = i32::try_from(pid).ok()?;
    let stat = procfs::process::Process::new(raw).ok()?.stat().ok()?;
    u32::try_from(stat.ppid).ok()
}
