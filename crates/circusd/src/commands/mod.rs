//! Commands and the command registry.
//!
//! A command validates its properties, then executes against the arbiter.
//! Execution either completes on the spot ([`Execution::Ready`]) or hands a
//! future back to the controller ([`Execution::Deferred`]), which runs it
//! off the reactor and answers once it resolves.
//!
//! Commands run on the reactor task. Anything that can block (waiting for
//! processes to exit, sampling system statistics) must be deferred.

mod builtin;

pub use builtin::{
    parse_signal, Decr, DStats, Incr, List, NumProcesses, NumWatchers, Quit, Restart, Signal,
    Start, Stats, Status, Stop,
};
pub(crate) use builtin::panic_message;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use circus_core::ProcessError;
use circus_protocol::{ErrorCode, Properties};
use serde_json::Value;
use thiserror::Error;

use crate::arbiter::{Arbiter, ArbiterError};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by `validate` or `execute`.
#[derive(Error, Debug)]
pub enum CommandError {
    /// User-facing failure: bad properties, illegal state transition
    #[error("{0}")]
    Message(String),

    /// The OS operation behind the command failed
    #[error(transparent)]
    Os(#[from] io::Error),

    /// Anything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// The command panicked
    #[error("panicked: {0}")]
    Panic(String),
}

impl CommandError {
    pub fn message(reason: impl Into<String>) -> Self {
        Self::Message(reason.into())
    }

    /// Wire error code for this failure.
    ///
    /// `Other` errors wrapping an I/O or process OS error are reported as
    /// OS errors.
    pub fn errno(&self) -> ErrorCode {
        match self {
            Self::Message(_) => ErrorCode::MessageError,
            Self::Os(_) => ErrorCode::OsError,
            Self::Other(e) if is_os_error(e) => ErrorCode::OsError,
            Self::Other(_) | Self::Panic(_) => ErrorCode::CommandError,
        }
    }
}

fn is_os_error(error: &anyhow::Error) -> bool {
    error.downcast_ref::<io::Error>().is_some()
        || error
            .downcast_ref::<ProcessError>()
            .is_some_and(|e| e.os_error().is_some())
}

impl From<ProcessError> for CommandError {
    fn from(error: ProcessError) -> Self {
        match error.os_error() {
            Some(source) => Self::Os(io::Error::new(source.kind(), error.to_string())),
            None => Self::Message(error.to_string()),
        }
    }
}

impl From<ArbiterError> for CommandError {
    fn from(error: ArbiterError) -> Self {
        match error {
            ArbiterError::Process(e) => e.into(),
            other => Self::Message(other.to_string()),
        }
    }
}

// ============================================================================
// Command trait
// ============================================================================

/// Output of a deferred command.
pub type CommandFuture = Pin<Box<dyn Future<Output = Result<Value, CommandError>> + Send>>;

/// How a command completes.
pub enum Execution {
    /// Result available immediately
    Ready(Result<Value, CommandError>),
    /// Result produced later by a spawned future
    Deferred(CommandFuture),
}

impl Execution {
    pub fn ok(value: Value) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, CommandError>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }
}

impl From<Result<Value, CommandError>> for Execution {
    fn from(result: Result<Value, CommandError>) -> Self {
        Self::Ready(result)
    }
}

/// A command handler.
pub trait Command: Send + Sync {
    /// Registry key (lower case).
    fn name(&self) -> &'static str;

    /// Checks the properties before execution.
    fn validate(&self, _properties: &Properties) -> Result<(), CommandError> {
        Ok(())
    }

    /// Runs the command.
    ///
    /// Must return a JSON object, array or null; anything else is answered
    /// with a bad-message-data error.
    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution;
}

// ============================================================================
// Registry
// ============================================================================

/// Command handlers keyed by lower-cased name.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Box<dyn Command>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in command.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Quit);
        registry.register(List);
        registry.register(NumWatchers);
        registry.register(NumProcesses);
        registry.register(Status);
        registry.register(Start);
        registry.register(Stop);
        registry.register(Restart);
        registry.register(Incr);
        registry.register(Decr);
        registry.register(Stats);
        registry.register(Signal);
        registry.register(DStats);
        registry
    }

    /// Adds a command, returning the one it replaced.
    pub fn register(&mut self, command: impl Command + 'static) -> Option<Box<dyn Command>> {
        self.commands
            .insert(command.name().to_lowercase(), Box::new(command))
    }

    /// Looks a command up, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&dyn Command> {
        self.commands.get(&name.to_lowercase()).map(|c| c.as_ref())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
