//! A watcher: a named pool of identical processes.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use circus_core::{Process, ProcessConfig, ProcessInfo, ProcessResult};
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, error, info, warn};

use super::Retired;

/// Longest chunk of child output logged as one line
const MAX_OUTPUT_LINE: u64 = 8 * 1024;

/// Whether a watcher keeps its processes running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Active,
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A named pool of processes built from one configuration.
///
/// Worker ids are the smallest free integers starting at 1.
#[derive(Debug)]
pub struct Watcher {
    name: String,
    config: ProcessConfig,
    numprocesses: usize,
    graceful_timeout: Duration,
    state: WatcherState,
    processes: BTreeMap<u32, Process>,
}

impl Watcher {
    /// Creates a stopped watcher.
    pub fn new(
        name: impl Into<String>,
        config: ProcessConfig,
        numprocesses: usize,
        graceful_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            config: ProcessConfig {
                spawn: true,
                ..config
            },
            numprocesses,
            graceful_timeout,
            state: WatcherState::Stopped,
            processes: BTreeMap::new(),
        }
    }

    /// Marks the watcher active without spawning; the next `manage` spawns.
    pub fn activated(mut self) -> Self {
        self.state = WatcherState::Active;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == WatcherState::Active
    }

    pub fn numprocesses(&self) -> usize {
        self.numprocesses
    }

    pub fn set_numprocesses(&mut self, numprocesses: usize) {
        info!(watcher = %self.name, from = self.numprocesses, to = numprocesses, "Scaling watcher");
        self.numprocesses = numprocesses;
    }

    pub fn graceful_timeout(&self) -> Duration {
        self.graceful_timeout
    }

    /// Number of processes currently held.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Pids of the running processes, in worker id order.
    pub fn pids(&self) -> Vec<u32> {
        self.processes.values().filter_map(Process::pid).collect()
    }

    /// Activates the watcher and spawns up to `numprocesses`.
    ///
    /// Unlike [`Watcher::manage`], spawn failures are returned.
    pub fn start(&mut self) -> ProcessResult<usize> {
        self.state = WatcherState::Active;
        info!(watcher = %self.name, "Starting watcher");
        self.spawn_missing()
    }

    /// Deactivates the watcher and hands every process back for teardown.
    pub fn stop(&mut self) -> Retired {
        self.state = WatcherState::Stopped;
        let mut retired = Retired::new();
        for (_, process) in std::mem::take(&mut self.processes) {
            retired.push(process, self.graceful_timeout);
        }
        info!(watcher = %self.name, processes = retired.len(), "Stopping watcher");
        retired
    }

    /// Reaps exited processes, spawns missing ones and retires extras.
    ///
    /// Spawn failures are logged and retried on the next call.
    pub fn manage(&mut self) -> Retired {
        self.reap();

        if !self.is_active() {
            return Retired::new();
        }

        if let Err(e) = self.spawn_missing() {
            error!(watcher = %self.name, error = %e, "Failed to spawn process");
        }
        self.retire_extras()
    }

    fn reap(&mut self) {
        let finished: Vec<u32> = self
            .processes
            .iter_mut()
            .filter_map(|(wid, process)| process.status().is_finished().then_some(*wid))
            .collect();

        for wid in finished {
            if let Some(mut process) = self.processes.remove(&wid) {
                let status = process.status();
                warn!(watcher = %self.name, wid, pid = ?process.pid(), %status, "Process exited");
            }
        }
    }

    fn next_wid(&self) -> u32 {
        let upper = u32::try_from(self.processes.len()).unwrap_or(u32::MAX).saturating_add(1);
        (1..=upper)
            .find(|wid| !self.processes.contains_key(wid))
            .unwrap_or(upper)
    }

    fn spawn_missing(&mut self) -> ProcessResult<usize> {
        let mut spawned = 0;
        while self.processes.len() < self.numprocesses {
            let wid = self.next_wid();
            let mut process = Process::new(wid.to_string(), self.config.clone())?;
            debug!(watcher = %self.name, wid, pid = ?process.pid(), "Spawned process");
            if let Some(stdout) = process.take_stdout() {
                forward_output(&self.name, wid, "stdout", stdout);
            }
            if let Some(stderr) = process.take_stderr() {
                forward_output(&self.name, wid, "stderr", stderr);
            }
            self.processes.insert(wid, process);
            spawned += 1;
        }
        Ok(spawned)
    }

    fn retire_extras(&mut self) -> Retired {
        let mut retired = Retired::new();
        while self.processes.len() > self.numprocesses {
            let oldest = self
                .processes
                .iter()
                .max_by_key(|(_, process)| process.age())
                .map(|(wid, _)| *wid);
            let Some(process) = oldest.and_then(|wid| self.processes.remove(&wid)) else {
                break;
            };
            debug!(watcher = %self.name, wid = %process.wid(), "Retiring process");
            retired.push(process, self.graceful_timeout);
        }
        retired
    }

    /// Snapshot of every process, using an already-refreshed `System`.
    pub fn process_info(&mut self, system: &System) -> Vec<ProcessInfo> {
        self.processes
            .values_mut()
            .map(|process| process.info(system))
            .collect()
    }

    /// Sends `signum` to every running process. Returns how many were
    /// signalled.
    pub fn signal(&mut self, signum: i32) -> usize {
        let mut signalled = 0;
        for process in self.processes.values_mut() {
            match process.send_signal(signum) {
                Ok(()) => signalled += 1,
                Err(e) => debug!(watcher = %self.name, wid = %process.wid(), error = %e, "Signal skipped"),
            }
        }
        signalled
    }
}

/// Logs a piped child stream line by line until EOF, on its own thread.
///
/// Nothing else reads the pipe, so without this a chatty child would block
/// once the pipe buffer fills up.
fn forward_output(watcher: &str, wid: u32, stream: &'static str, output: File) {
    let name = watcher.to_string();
    let forward = move || {
        let mut reader = BufReader::new(output);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.by_ref().take(MAX_OUTPUT_LINE).read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    info!(watcher = %name, wid, stream, line = %text.trim_end(), "Process output");
                }
                Err(e) => {
                    debug!(watcher = %name, wid, stream, error = %e, "Output read failed");
                    break;
                }
            }
        }
    };

    let spawned = std::thread::Builder::new()
        .name(format!("{watcher}-{wid}-{stream}"))
        .spawn(forward);
    if let Err(e) = spawned {
        warn!(watcher, wid, stream, error = %e, "Failed to forward process output");
    }
}
