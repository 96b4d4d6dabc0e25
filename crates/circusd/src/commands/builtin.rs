//! Built-in commands.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use circus_protocol::Properties;
use serde_json::{json, Value};

use super::{Command, CommandError, Execution};
use crate::arbiter::{Arbiter, Retired};
use crate::monitor::ProcessMonitor;

// ============================================================================
// Property helpers
// ============================================================================

fn optional_name(properties: &Properties) -> Result<Option<String>, CommandError> {
    match properties.get("name") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(name.clone())),
        Some(other) => Err(CommandError::message(format!(
            "name must be a string, got {other}"
        ))),
    }
}

fn required_name(properties: &Properties) -> Result<String, CommandError> {
    optional_name(properties)?
        .ok_or_else(|| CommandError::message("message invalid: 'name' property is required"))
}

/// Reads a strictly positive integer, falling back to `default` if absent.
fn positive_int(properties: &Properties, key: &str, default: usize) -> Result<usize, CommandError> {
    match properties.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .filter(|n| *n > 0)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                CommandError::message(format!("{key} must be a positive integer, got {value}"))
            }),
    }
}

/// Parses a signal given as a number or a name (`TERM`, `sigterm`, ...).
pub fn parse_signal(value: &Value) -> Option<i32> {
    if let Some(n) = value.as_i64() {
        return i32::try_from(n).ok().filter(|n| *n > 0);
    }
    let name = value.as_str()?.trim().to_ascii_uppercase();
    if let Ok(n) = name.parse::<i32>() {
        return (n > 0).then_some(n);
    }
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let signum = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CHLD" => libc::SIGCHLD,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "WINCH" => libc::SIGWINCH,
        _ => return None,
    };
    Some(signum)
}

fn signum(properties: &Properties) -> Result<i32, CommandError> {
    let value = properties
        .get("signum")
        .ok_or_else(|| CommandError::message("message invalid: 'signum' property is required"))?;
    parse_signal(value).ok_or_else(|| CommandError::message(format!("unknown signal: {value}")))
}

/// Watchers targeted by a command: the named one, or all of them.
fn targets(arbiter: &Arc<dyn Arbiter>, name: Option<String>) -> Result<Vec<String>, CommandError> {
    match name {
        Some(name) => Ok(vec![name]),
        None => Ok(arbiter.watcher_names()?),
    }
}

/// Renders a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

/// Runs blocking work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, CommandError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        if e.is_panic() {
            CommandError::Panic(panic_message(e.into_panic()))
        } else {
            CommandError::Other(anyhow::anyhow!("blocking task cancelled: {e}"))
        }
    })
}

// ============================================================================
// Commands
// ============================================================================

/// Stops the daemon. The controller handles the actual shutdown once the
/// reply is out.
pub struct Quit;

impl Command for Quit {
    fn name(&self) -> &'static str {
        "quit"
    }

    fn execute(&self, _arbiter: &Arc<dyn Arbiter>, _properties: &Properties) -> Execution {
        Execution::ok(Value::Null)
    }
}

/// Lists watchers, or the pids of one watcher.
pub struct List;

impl Command for List {
    fn name(&self) -> &'static str {
        "list"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        optional_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let result = optional_name(properties).and_then(|name| match name {
            Some(name) => Ok(json!({ "pids": arbiter.pids(&name)? })),
            None => Ok(json!({ "watchers": arbiter.watcher_names()? })),
        });
        result.into()
    }
}

/// Number of watchers.
pub struct NumWatchers;

impl Command for NumWatchers {
    fn name(&self) -> &'static str {
        "numwatchers"
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, _properties: &Properties) -> Execution {
        let result = arbiter
            .watcher_names()
            .map(|names| json!({ "numwatchers": names.len() }))
            .map_err(CommandError::from);
        result.into()
    }
}

/// Target process count of one watcher, or the total.
pub struct NumProcesses;

impl Command for NumProcesses {
    fn name(&self) -> &'static str {
        "numprocesses"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        optional_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let result = optional_name(properties).and_then(|name| {
            let mut total = 0;
            for watcher in targets(arbiter, name)? {
                total += arbiter.numprocesses(&watcher)?;
            }
            Ok(json!({ "numprocesses": total }))
        });
        result.into()
    }
}

/// State of one watcher, or of all of them.
pub struct Status;

impl Command for Status {
    fn name(&self) -> &'static str {
        "status"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        optional_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let result = optional_name(properties).and_then(|name| match name {
            // `status` is taken by the response envelope
            Some(name) => {
                let state = arbiter.watcher_status(&name)?.to_string();
                Ok(json!({ "name": name, "state": state }))
            }
            None => {
                let mut statuses = BTreeMap::new();
                for watcher in arbiter.watcher_names()? {
                    let status = arbiter.watcher_status(&watcher)?.to_string();
                    statuses.insert(watcher, status);
                }
                Ok(json!({ "statuses": statuses }))
            }
        });
        result.into()
    }
}

/// Starts one watcher, or all of them.
pub struct Start;

impl Command for Start {
    fn name(&self) -> &'static str {
        "start"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        optional_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let result = optional_name(properties).and_then(|name| {
            for watcher in targets(arbiter, name)? {
                arbiter.start_watcher(&watcher)?;
            }
            Ok(Value::Null)
        });
        result.into()
    }
}

/// Takes processes out of the named watchers and stops them off the
/// reactor. The watchers are deactivated before this returns.
fn retire_watchers(
    arbiter: &Arc<dyn Arbiter>,
    properties: &Properties,
) -> Result<(Vec<String>, Retired), CommandError> {
    let names = targets(arbiter, optional_name(properties)?)?;
    let mut retired = Retired::new();
    for name in &names {
        retired.extend(arbiter.stop_watcher(name)?);
    }
    Ok((names, retired))
}

/// Stops one watcher, or all of them. Deferred: waits for the processes to
/// exit.
pub struct Stop;

impl Command for Stop {
    fn name(&self) -> &'static str {
        "stop"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        optional_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let (_, retired) = match retire_watchers(arbiter, properties) {
            Ok(stopped) => stopped,
            Err(e) => return Execution::Ready(Err(e)),
        };
        Execution::deferred(async move {
            let stopped = blocking(move || retired.stop_all()).await?;
            Ok(json!({ "stopped": stopped }))
        })
    }
}

/// Stops then starts one watcher, or all of them. Deferred.
pub struct Restart;

impl Command for Restart {
    fn name(&self) -> &'static str {
        "restart"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        optional_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let (names, retired) = match retire_watchers(arbiter, properties) {
            Ok(stopped) => stopped,
            Err(e) => return Execution::Ready(Err(e)),
        };
        let arbiter = Arc::clone(arbiter);
        Execution::deferred(async move {
            blocking(move || retired.stop_all()).await?;
            for name in &names {
                arbiter.start_watcher(name)?;
            }
            Ok(json!({ "restarted": names }))
        })
    }
}

fn validate_scaling(properties: &Properties) -> Result<(), CommandError> {
    required_name(properties)?;
    positive_int(properties, "nb", 1)?;
    Ok(())
}

fn scale(
    arbiter: &Arc<dyn Arbiter>,
    properties: &Properties,
    apply: impl FnOnce(usize, usize) -> usize,
) -> Result<Value, CommandError> {
    let name = required_name(properties)?;
    let nb = positive_int(properties, "nb", 1)?;
    let current = arbiter.numprocesses(&name)?;
    let target = arbiter.set_numprocesses(&name, apply(current, nb))?;
    arbiter.manage_watchers();
    Ok(json!({ "numprocesses": target }))
}

/// Adds `nb` (default 1) processes to a watcher.
pub struct Incr;

impl Command for Incr {
    fn name(&self) -> &'static str {
        "incr"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        validate_scaling(properties)
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        scale(arbiter, properties, |current, nb| current.saturating_add(nb)).into()
    }
}

/// Removes `nb` (default 1) processes from a watcher.
pub struct Decr;

impl Command for Decr {
    fn name(&self) -> &'static str {
        "decr"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        validate_scaling(properties)
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        scale(arbiter, properties, |current, nb| current.saturating_sub(nb)).into()
    }
}

/// Per-process statistics of a watcher. Deferred.
pub struct Stats;

impl Command for Stats {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        required_name(properties).map(|_| ())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let name = match required_name(properties) {
            Ok(name) => name,
            Err(e) => return Execution::Ready(Err(e)),
        };
        let arbiter = Arc::clone(arbiter);
        Execution::deferred(async move {
            let lookup = name.clone();
            let info = blocking(move || arbiter.process_info(&lookup)).await??;
            let info = serde_json::to_value(info).map_err(anyhow::Error::from)?;
            Ok(json!({ "name": name, "info": info }))
        })
    }
}

/// Sends a signal to every process of a watcher.
pub struct Signal;

impl Command for Signal {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
        required_name(properties)?;
        signum(properties)?;
        Ok(())
    }

    fn execute(&self, arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
        let result = required_name(properties).and_then(|name| {
            let signum = signum(properties)?;
            let signalled = arbiter.signal_watcher(&name, signum)?;
            Ok(json!({ "signalled": signalled }))
        });
        result.into()
    }
}

/// Resource usage of the daemon itself. Deferred: CPU sampling needs two
/// measurements some time apart.
pub struct DStats;

impl Command for DStats {
    fn name(&self) -> &'static str {
        "dstats"
    }

    fn execute(&self, _arbiter: &Arc<dyn Arbiter>, _properties: &Properties) -> Execution {
        Execution::deferred(async move {
            let metrics = blocking(|| ProcessMonitor::new().sample()).await?;
            let info = serde_json::to_value(metrics).map_err(anyhow::Error::from)?;
            Ok(json!({ "info": info }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterError, WatcherState};
    use std::sync::Mutex;

    /// In-memory arbiter with fixed watchers.
    #[derive(Default)]
    struct FakeArbiter {
        numprocesses: Mutex<BTreeMap<String, usize>>,
        managed: Mutex<usize>,
        signals: Mutex<Vec<(String, i32)>>,
    }

    impl FakeArbiter {
        fn with_watchers(names: &[(&str, usize)]) -> Arc<dyn Arbiter> {
            let arbiter = Self::default();
            {
                let mut map = arbiter.numprocesses.lock().unwrap();
                for (name, n) in names {
                    map.insert(name.to_string(), *n);
                }
            }
            Arc::new(arbiter)
        }

        fn check(&self, name: &str) -> Result<(), ArbiterError> {
            if self.numprocesses.lock().unwrap().contains_key(name) {
                Ok(())
            } else {
                Err(ArbiterError::UnknownWatcher(name.to_string()))
            }
        }
    }

    impl Arbiter for FakeArbiter {
        fn manage_watchers(&self) {
            *self.managed.lock().unwrap() += 1;
        }

        fn stop(&self) {}

        fn watcher_names(&self) -> Result<Vec<String>, ArbiterError> {
            Ok(self.numprocesses.lock().unwrap().keys().cloned().collect())
        }

        fn watcher_status(&self, name: &str) -> Result<WatcherState, ArbiterError> {
            self.check(name)?;
            Ok(WatcherState::Active)
        }

        fn numprocesses(&self, name: &str) -> Result<usize, ArbiterError> {
            self.check(name)?;
            Ok(self.numprocesses.lock().unwrap()[name])
        }

        fn set_numprocesses(&self, name: &str, n: usize) -> Result<usize, ArbiterError> {
            self.check(name)?;
            self.numprocesses.lock().unwrap().insert(name.to_string(), n);
            Ok(n)
        }

        fn pids(&self, name: &str) -> Result<Vec<u32>, ArbiterError> {
            self.check(name)?;
            Ok(vec![100, 101])
        }

        fn signal_watcher(&self, name: &str, signum: i32) -> Result<usize, ArbiterError> {
            self.check(name)?;
            self.signals.lock().unwrap().push((name.to_string(), signum));
            Ok(2)
        }
    }

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn ready(execution: Execution) -> Result<Value, CommandError> {
        match execution {
            Execution::Ready(result) => result,
            Execution::Deferred(_) => panic!("expected an immediate result"),
        }
    }

    #[test]
    fn test_list() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 2), ("db", 1)]);
        let result = ready(List.execute(&arbiter, &Properties::new())).unwrap();
        assert_eq!(result, json!({"watchers": ["db", "web"]}));

        let result = ready(List.execute(&arbiter, &props(json!({"name": "web"})))).unwrap();
        assert_eq!(result, json!({"pids": [100, 101]}));

        let err = ready(List.execute(&arbiter, &props(json!({"name": "nope"})))).unwrap_err();
        assert!(matches!(err, CommandError::Message(_)));
    }

    #[test]
    fn test_numprocesses_and_numwatchers() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 2), ("db", 3)]);
        assert_eq!(
            ready(NumProcesses.execute(&arbiter, &Properties::new())).unwrap(),
            json!({"numprocesses": 5})
        );
        assert_eq!(
            ready(NumProcesses.execute(&arbiter, &props(json!({"name": "db"})))).unwrap(),
            json!({"numprocesses": 3})
        );
        assert_eq!(
            ready(NumWatchers.execute(&arbiter, &Properties::new())).unwrap(),
            json!({"numwatchers": 2})
        );
    }

    #[test]
    fn test_status() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 1)]);
        assert_eq!(
            ready(Status.execute(&arbiter, &props(json!({"name": "web"})))).unwrap(),
            json!({"name": "web", "state": "active"})
        );
        assert_eq!(
            ready(Status.execute(&arbiter, &Properties::new())).unwrap(),
            json!({"statuses": {"web": "active"}})
        );
    }

    #[test]
    fn test_incr_decr() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 2)]);
        let result = ready(Incr.execute(&arbiter, &props(json!({"name": "web", "nb": 3})))).unwrap();
        assert_eq!(result, json!({"numprocesses": 5}));

        let result = ready(Decr.execute(&arbiter, &props(json!({"name": "web"})))).unwrap();
        assert_eq!(result, json!({"numprocesses": 4}));

        let result = ready(Decr.execute(&arbiter, &props(json!({"name": "web", "nb": 10})))).unwrap();
        assert_eq!(result, json!({"numprocesses": 0}));
    }

    #[test]
    fn test_scaling_validation() {
        assert!(Incr.validate(&Properties::new()).is_err());
        assert!(Incr.validate(&props(json!({"name": "web", "nb": 0}))).is_err());
        assert!(Incr.validate(&props(json!({"name": "web", "nb": "2"}))).is_err());
        assert!(Decr.validate(&props(json!({"name": 3}))).is_err());
        assert!(Decr.validate(&props(json!({"name": "web", "nb": 2}))).is_ok());
    }

    #[test]
    fn test_signal() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 2)]);
        assert!(Signal.validate(&props(json!({"name": "web"}))).is_err());
        assert!(Signal.validate(&props(json!({"name": "web", "signum": "BOGUS"}))).is_err());

        let result =
            ready(Signal.execute(&arbiter, &props(json!({"name": "web", "signum": "hup"})))).unwrap();
        assert_eq!(result, json!({"signalled": 2}));
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal(&json!(15)), Some(libc::SIGTERM));
        assert_eq!(parse_signal(&json!("SIGKILL")), Some(libc::SIGKILL));
        assert_eq!(parse_signal(&json!("term")), Some(libc::SIGTERM));
        assert_eq!(parse_signal(&json!("9")), Some(9));
        assert_eq!(parse_signal(&json!(0)), None);
        assert_eq!(parse_signal(&json!(-3)), None);
        assert_eq!(parse_signal(&json!("NOPE")), None);
        assert_eq!(parse_signal(&json!(null)), None);
    }

    #[test]
    fn test_quit_returns_null() {
        let arbiter = FakeArbiter::with_watchers(&[]);
        assert_eq!(ready(Quit.execute(&arbiter, &Properties::new())).unwrap(), Value::Null);
    }

    #[test]
    fn test_unsupported_operation_is_a_message_error() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 1)]);
        let err = ready(Start.execute(&arbiter, &Properties::new())).unwrap_err();
        assert!(matches!(err, CommandError::Message(m) if m.contains("not supported")));
    }

    #[tokio::test]
    async fn test_stop_reports_arbiter_errors_immediately() {
        let arbiter = FakeArbiter::with_watchers(&[("web", 1)]);
        // FakeArbiter has no stop_watcher: the error comes back immediately
        assert!(matches!(
            Stop.execute(&arbiter, &props(json!({"name": "web"}))),
            Execution::Ready(Err(_))
        ));
    }

    #[tokio::test]
    async fn test_dstats_reports_daemon_metrics() {
        let arbiter = FakeArbiter::with_watchers(&[]);
        let Execution::Deferred(future) = DStats.execute(&arbiter, &Properties::new()) else {
            panic!("dstats must be deferred");
        };
        let result = future.await.unwrap();
        assert!(result["info"]["memory_bytes"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
