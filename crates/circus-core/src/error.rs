//! Error types for the process primitive.

use std::io;

use thiserror::Error;

use crate::rlimit::RlimitError;
use crate::template::TemplateError;

/// Errors that can occur while configuring, spawning or controlling a process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Argument templating failed (unknown token, missing env key, bad quoting)
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// An rlimit name or value is not usable
    #[error(transparent)]
    Rlimit(#[from] RlimitError),

    /// The resolved command line has no program to run
    #[error("empty command for process {wid}")]
    EmptyCommand { wid: String },

    /// `spawn` was called on a process that already has a child
    #[error("process {wid} already spawned (pid {pid})")]
    AlreadySpawned { wid: String, pid: u32 },

    /// The operation needs a running child
    #[error("process {wid} is not spawned")]
    NotSpawned { wid: String },

    /// fork/exec failed, including rlimit failures inside the child
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    /// kill(2) failed
    #[error("failed to send signal {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: i32,
        #[source]
        source: io::Error,
    },

    /// waitpid failed
    #[error("failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl ProcessError {
    /// Returns the underlying OS error for failures of the OS itself.
    ///
    /// Configuration errors (templating, rlimit names, state) return `None`.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Self::Spawn { source, .. } | Self::Signal { source, .. } | Self::Wait { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;
