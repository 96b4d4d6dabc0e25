//! Parse, validate, execute, respond.
//!
//! Every inbound frame becomes a [`Job`] on a FIFO queue that the reactor
//! drains in arrival order. Dispatch never fails outward: each problem is
//! turned into an error response (or dropped, for casts and anonymous
//! senders) and the reactor carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use circus_protocol::{ControlMessage, ErrorCode, MsgType, ParseError, Response};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::arbiter::Arbiter;
use crate::commands::{panic_message, CommandError, CommandFuture, CommandRegistry, Execution};
use crate::router::{ClientIdentity, Multipart, Outbound};

/// A frame waiting to be dispatched.
#[derive(Debug, Clone)]
pub struct Job {
    /// `None` when there is no reply channel
    pub identity: Option<ClientIdentity>,
    pub payload: Bytes,
}

/// What the response path needs to know about a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Option<ClientIdentity>,
    pub id: Value,
    pub cast: bool,
    /// Lower-cased command name
    pub name: String,
    /// The frame as received, for error reports
    pub raw: String,
}

/// Outcome of a deferred command, sent back to the reactor.
pub struct Completion {
    pub ctx: RequestContext,
    pub outcome: Result<Value, CommandError>,
}

/// Receiving ends drained by the reactor loop.
pub struct DispatchQueues {
    pub jobs: mpsc::UnboundedReceiver<Job>,
    pub completions: mpsc::UnboundedReceiver<Completion>,
}

/// A normalized command result.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Mapping(Map<String, Value>),
    Sequence(Vec<Value>),
}

impl TryFrom<Value> for Reply {
    /// Scalars are handed back untouched
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(Self::Empty),
            Value::Object(map) => Ok(Self::Mapping(map)),
            Value::Array(items) => Ok(Self::Sequence(items)),
            other => Err(other),
        }
    }
}

impl Reply {
    /// Body fields of the success response. Sequences go under `results`.
    pub fn into_fields(self) -> Map<String, Value> {
        match self {
            Self::Empty => Map::new(),
            Self::Mapping(map) => map,
            Self::Sequence(items) => {
                let mut map = Map::new();
                map.insert("results".to_string(), Value::Array(items));
                map
            }
        }
    }
}

/// Runs commands and answers them.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    arbiter: Arc<dyn Arbiter>,
    outbound: Arc<dyn Outbound>,
    jobs: mpsc::UnboundedSender<Job>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        arbiter: Arc<dyn Arbiter>,
        outbound: Arc<dyn Outbound>,
    ) -> (Self, DispatchQueues) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            registry,
            arbiter,
            outbound,
            jobs: jobs_tx,
            completions: completions_tx,
        };
        let queues = DispatchQueues {
            jobs: jobs_rx,
            completions: completions_rx,
        };
        (dispatcher, queues)
    }

    /// Ingress. Blank frames are answered right away; anything else is
    /// queued for [`Dispatcher::dispatch`].
    pub fn handle_message(&self, identity: Option<ClientIdentity>, payload: Bytes) {
        let trimmed = payload.trim_ascii();
        if trimmed.is_empty() {
            self.send_response(
                identity.as_ref(),
                false,
                Value::Null,
                Response::error("empty command", None, ErrorCode::NotSpecified),
            );
            return;
        }

        let payload = payload.slice_ref(trimmed);
        if self.jobs.send(Job { identity, payload }).is_err() {
            debug!("Job queue closed, frame dropped");
        }
    }

    /// Runs one queued job.
    pub async fn dispatch(&self, job: Job) {
        let Job { identity, payload } = job;

        let message = match ControlMessage::parse(&payload) {
            Ok(message) => message,
            Err(e @ ParseError::InvalidJson(_)) => {
                debug!(error = %e, "Rejected frame");
                let response = Response::error(e.to_string(), None, ErrorCode::InvalidJson);
                self.send_response(identity.as_ref(), false, Value::Null, response);
                return;
            }
            Err(ParseError::Malformed {
                id,
                msg_type,
                reason,
            }) => {
                debug!(%reason, "Rejected message");
                let response = Response::error(reason, None, ErrorCode::MessageError);
                self.send_response(identity.as_ref(), msg_type == MsgType::Cast, id, response);
                return;
            }
        };

        let ctx = RequestContext {
            identity,
            id: message.id,
            cast: message.msg_type == MsgType::Cast,
            name: message.command.to_lowercase(),
            raw: String::from_utf8_lossy(&payload).into_owned(),
        };

        let Some(command) = self.registry.get(&ctx.name) else {
            let reason = format!("unknown command: {:?}", message.command);
            let response = Response::error(reason, None, ErrorCode::UnknownCommand);
            self.send_response(ctx.identity.as_ref(), ctx.cast, ctx.id, response);
            return;
        };

        trace!(command = %ctx.name, id = %ctx.id, "Dispatching");
        let properties = message.properties;
        let arbiter = &self.arbiter;
        let execution = catch_unwind(AssertUnwindSafe(|| {
            command.validate(&properties)?;
            Ok::<_, CommandError>(command.execute(arbiter, &properties))
        }));

        match execution {
            Ok(Ok(Execution::Ready(outcome))) => self.finish(ctx, outcome).await,
            Ok(Ok(Execution::Deferred(future))) => self.defer(ctx, future),
            Ok(Err(e)) => self.finish(ctx, Err(e)).await,
            Err(payload) => {
                let panic = CommandError::Panic(panic_message(payload));
                self.finish(ctx, Err(panic)).await;
            }
        }
    }

    /// Handles a deferred command's outcome.
    pub async fn complete(&self, completion: Completion) {
        self.finish(completion.ctx, completion.outcome).await;
    }

    fn defer(&self, ctx: RequestContext, future: CommandFuture) {
        debug!(command = %ctx.name, "Command deferred");
        let completions = self.completions.clone();
        let task = tokio::spawn(future);
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(CommandError::Panic(panic_message(e.into_panic()))),
                Err(e) => Err(CommandError::Other(anyhow::anyhow!("command task cancelled: {e}"))),
            };
            if completions.send(Completion { ctx, outcome }).is_err() {
                debug!("Completion queue closed, result dropped");
            }
        });
    }

    /// Normalizes an outcome, responds, then applies the quit special case.
    async fn finish(&self, ctx: RequestContext, outcome: Result<Value, CommandError>) {
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                let errno = e.errno();
                let (reason, tb) = describe(&ctx, &e, errno);
                self.send_response(
                    ctx.identity.as_ref(),
                    ctx.cast,
                    ctx.id,
                    Response::error(reason, tb, errno),
                );
                return;
            }
        };

        let reply = match Reply::try_from(value) {
            Ok(reply) => reply,
            Err(value) => {
                error!(command = %ctx.name, result = %value, "Command returned a scalar");
                let response = Response::error("server error", None, ErrorCode::BadMsgDataError);
                self.send_response(ctx.identity.as_ref(), ctx.cast, ctx.id, response);
                return;
            }
        };

        let response = Response::ok(reply.into_fields());
        self.send_response(ctx.identity.as_ref(), ctx.cast, ctx.id.clone(), response);

        if ctx.name == "quit" {
            if let Some(identity) = &ctx.identity {
                if let Err(e) = self.outbound.flush(identity).await {
                    debug!(peer = %identity, error = %e, "Flush before quit failed");
                }
            }
            info!("Quit requested, stopping arbiter");
            self.arbiter.stop();
        }
    }

    /// Sends a response unless the message was a cast or there is nobody to
    /// answer. Transport failures are logged and dropped.
    fn send_response(
        &self,
        identity: Option<&ClientIdentity>,
        cast: bool,
        id: Value,
        response: Response,
    ) {
        if cast {
            return;
        }
        let Some(identity) = identity else {
            return;
        };

        let payload = match response.with_id(id).to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                return;
            }
        };

        if let Err(e) = self.outbound.send(Multipart::new(identity.clone(), payload)) {
            debug!(peer = %identity, error = %e, "Response dropped");
        }
    }
}

/// Reason and traceback for a failed command.
fn describe(ctx: &RequestContext, error: &CommandError, errno: ErrorCode) -> (String, Option<String>) {
    match error {
        CommandError::Message(reason) => (reason.clone(), None),
        CommandError::Os(e) => (e.to_string(), None),
        CommandError::Other(e) if errno == ErrorCode::OsError => (e.to_string(), None),
        CommandError::Other(e) => {
            let tb = format!("{e:?}");
            error!(command = %ctx.name, error = %e, tb = %tb, "Command failed");
            (format!("command {:?}: {e}", ctx.raw), Some(tb))
        }
        CommandError::Panic(message) => {
            error!(command = %ctx.name, panic = %message, "Command panicked");
            (format!("command {:?}: panicked: {message}", ctx.raw), Some(message.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::router::TransportError;
    use async_trait::async_trait;
    use circus_protocol::Properties;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Shared log of arbiter and transport calls, to check ordering.
    type Events = Arc<Mutex<Vec<String>>>;

    struct MockArbiter {
        events: Events,
    }

    impl Arbiter for MockArbiter {
        fn manage_watchers(&self) {
            self.events.lock().unwrap().push("manage".into());
        }

        fn stop(&self) {
            self.events.lock().unwrap().push("stop".into());
        }
    }

    struct RecordingOutbound {
        events: Events,
        sent: Mutex<Vec<(ClientIdentity, Value)>>,
    }

    impl RecordingOutbound {
        fn responses(&self) -> Vec<Value> {
            self.sent.lock().unwrap().iter().map(|(_, v)| v.clone()).collect()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        fn send(&self, message: Multipart) -> Result<(), TransportError> {
            let value: Value = serde_json::from_slice(&message.payload).unwrap();
            self.events.lock().unwrap().push("send".into());
            self.sent.lock().unwrap().push((message.identity, value));
            Ok(())
        }

        async fn flush(&self, _identity: &ClientIdentity) -> Result<(), TransportError> {
            self.events.lock().unwrap().push("flush".into());
            Ok(())
        }
    }

    struct Fixed(&'static str, Value);

    impl Command for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn execute(&self, _arbiter: &Arc<dyn Arbiter>, _properties: &Properties) -> Execution {
            Execution::ok(self.1.clone())
        }
    }

    struct Picky;

    impl Command for Picky {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn validate(&self, properties: &Properties) -> Result<(), CommandError> {
            if properties.contains_key("name") {
                Ok(())
            } else {
                Err(CommandError::message("name is required"))
            }
        }

        fn execute(&self, _arbiter: &Arc<dyn Arbiter>, _properties: &Properties) -> Execution {
            Execution::ok(Value::Null)
        }
    }

    struct Failing;

    impl Command for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn execute(&self, _arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
            match properties.get("kind").and_then(Value::as_str) {
                Some("os") => Execution::Ready(Err(std::io::Error::from_raw_os_error(libc::EPERM).into())),
                Some("panic") => panic!("kaboom"),
                _ => Execution::Ready(Err(anyhow::anyhow!("something broke").into())),
            }
        }
    }

    struct Slow;

    impl Command for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn execute(&self, _arbiter: &Arc<dyn Arbiter>, properties: &Properties) -> Execution {
            let panics = properties.contains_key("panic");
            Execution::deferred(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if panics {
                    panic!("deferred kaboom");
                }
                Ok(json!([1, 2]))
            })
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        queues: DispatchQueues,
        outbound: Arc<RecordingOutbound>,
        events: Events,
    }

    fn fixture() -> Fixture {
        let events: Events = Arc::default();
        let mut registry = CommandRegistry::with_defaults();
        registry.register(Fixed("mapping", json!({"a": 1})));
        registry.register(Fixed("sequence", json!(["x", "y"])));
        registry.register(Fixed("scalar", json!(42)));
        registry.register(Picky);
        registry.register(Failing);
        registry.register(Slow);

        let outbound = Arc::new(RecordingOutbound {
            events: Arc::clone(&events),
            sent: Mutex::default(),
        });
        let arbiter = Arc::new(MockArbiter {
            events: Arc::clone(&events),
        });
        let (dispatcher, queues) =
            Dispatcher::new(Arc::new(registry), arbiter, Arc::clone(&outbound) as Arc<dyn Outbound>);
        Fixture {
            dispatcher,
            queues,
            outbound,
            events,
        }
    }

    fn peer() -> Option<ClientIdentity> {
        Some(ClientIdentity::new("peer"))
    }

    impl Fixture {
        /// Ingress then dispatch of everything queued.
        async fn request(&mut self, payload: &str) {
            self.dispatcher.handle_message(peer(), Bytes::from(payload.to_string()));
            while let Ok(job) = self.queues.jobs.try_recv() {
                self.dispatcher.dispatch(job).await;
            }
        }

        async fn request_json(&mut self, message: Value) -> Value {
            self.request(&message.to_string()).await;
            self.last()
        }

        fn last(&self) -> Value {
            self.outbound.responses().pop().expect("no response sent")
        }
    }

    #[test]
    fn test_reply_normalization() {
        assert_eq!(Reply::try_from(Value::Null).unwrap().into_fields(), Map::new());
        assert_eq!(
            Value::Object(Reply::try_from(json!([1])).unwrap().into_fields()),
            json!({"results": [1]})
        );
        assert_eq!(
            Value::Object(Reply::try_from(json!({"k": "v"})).unwrap().into_fields()),
            json!({"k": "v"})
        );
        assert_eq!(Reply::try_from(json!("s")), Err(json!("s")));
        assert_eq!(Reply::try_from(json!(true)), Err(json!(true)));
    }

    #[tokio::test]
    async fn test_success_shapes() {
        let mut f = fixture();

        let r = f.request_json(json!({"id": 1, "command": "mapping"})).await;
        assert_eq!(r["status"], "ok");
        assert_eq!(r["a"], 1);
        assert_eq!(r["id"], 1);
        assert!(r["time"].as_f64().unwrap() > 0.0);

        let r = f.request_json(json!({"id": "abc", "command": "SEQUENCE"})).await;
        assert_eq!(r["results"], json!(["x", "y"]));
        assert_eq!(r["id"], "abc");

        let r = f.request_json(json!({"command": "picky", "properties": {"name": "w"}})).await;
        assert_eq!(r["status"], "ok");
        assert_eq!(r["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_error_codes() {
        let mut f = fixture();

        f.request("{not json").await;
        let r = f.last();
        assert_eq!(r["errno"], ErrorCode::InvalidJson.code());
        assert_eq!(r["id"], Value::Null);
        assert!(r["reason"].as_str().unwrap().starts_with("json invalid"));

        let r = f.request_json(json!({"id": 2, "command": "Bogus"})).await;
        assert_eq!(r["errno"], ErrorCode::UnknownCommand.code());
        assert!(r["reason"].as_str().unwrap().contains("Bogus"));
        assert_eq!(r["id"], 2);

        let r = f.request_json(json!({"id": 3, "properties": {}})).await;
        assert_eq!(r["errno"], ErrorCode::MessageError.code());
        assert_eq!(r["id"], 3);

        let r = f.request_json(json!({"id": 4, "command": "picky"})).await;
        assert_eq!(r["errno"], ErrorCode::MessageError.code());
        assert_eq!(r["reason"], "name is required");
        assert_eq!(r["tb"], Value::Null);

        let r = f.request_json(json!({"id": 5, "command": "scalar"})).await;
        assert_eq!(r["errno"], ErrorCode::BadMsgDataError.code());
        assert_eq!(r["reason"], "server error");
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let mut f = fixture();

        let r = f
            .request_json(json!({"command": "failing", "properties": {"kind": "os"}}))
            .await;
        assert_eq!(r["errno"], ErrorCode::OsError.code());
        assert_eq!(r["tb"], Value::Null);

        let r = f.request_json(json!({"command": "failing"})).await;
        assert_eq!(r["errno"], ErrorCode::CommandError.code());
        assert!(r["reason"].as_str().unwrap().contains("something broke"));
        assert!(r["tb"].is_string());

        let r = f
            .request_json(json!({"command": "failing", "properties": {"kind": "panic"}}))
            .await;
        assert_eq!(r["errno"], ErrorCode::CommandError.code());
        assert!(r["reason"].as_str().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_empty_frame_is_answered_immediately() {
        let mut f = fixture();
        f.dispatcher.handle_message(peer(), Bytes::from_static(b"  \n\t"));
        assert!(f.queues.jobs.try_recv().is_err());

        let r = f.last();
        assert_eq!(r["reason"], "empty command");
        assert_eq!(r["errno"], ErrorCode::NotSpecified.code());
    }

    #[tokio::test]
    async fn test_jobs_keep_arrival_order() {
        let f = fixture();
        let mut queues = f.queues;
        for n in 0..3 {
            f.dispatcher.handle_message(peer(), Bytes::from(format!(" {n} ")));
        }
        for n in 0..3 {
            let job = queues.jobs.try_recv().unwrap();
            assert_eq!(job.payload, Bytes::from(n.to_string()));
        }
    }

    #[tokio::test]
    async fn test_cast_and_anonymous_get_no_response() {
        let mut f = fixture();
        f.request(&json!({"command": "mapping", "msg_type": "cast"}).to_string()).await;
        f.request(&json!({"command": "bogus", "msg_type": "cast"}).to_string()).await;

        f.dispatcher
            .dispatch(Job {
                identity: None,
                payload: Bytes::from_static(b"{\"command\": \"mapping\"}"),
            })
            .await;
        f.dispatcher.handle_message(None, Bytes::from_static(b""));

        assert!(f.outbound.responses().is_empty());
    }

    #[tokio::test]
    async fn test_quit_responds_flushes_then_stops() {
        let mut f = fixture();
        let r = f.request_json(json!({"id": 9, "command": "QUIT"})).await;
        assert_eq!(r["status"], "ok");
        assert_eq!(*f.events.lock().unwrap(), vec!["send", "flush", "stop"]);
    }

    #[tokio::test]
    async fn test_anonymous_quit_skips_flush() {
        let f = fixture();
        f.dispatcher
            .dispatch(Job {
                identity: None,
                payload: Bytes::from_static(b"{\"command\": \"quit\"}"),
            })
            .await;
        assert_eq!(*f.events.lock().unwrap(), vec!["stop"]);
    }

    #[tokio::test]
    async fn test_deferred_completion() {
        let mut f = fixture();
        f.request(&json!({"id": 7, "command": "slow"}).to_string()).await;
        assert!(f.outbound.responses().is_empty());

        let completion = tokio::time::timeout(Duration::from_secs(2), f.queues.completions.recv())
            .await
            .unwrap()
            .unwrap();
        f.dispatcher.complete(completion).await;

        let r = f.last();
        assert_eq!(r["id"], 7);
        assert_eq!(r["results"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_deferred_panic_becomes_command_error() {
        let mut f = fixture();
        f.request(&json!({"id": 8, "command": "slow", "properties": {"panic": true}}).to_string())
            .await;

        let completion = tokio::time::timeout(Duration::from_secs(2), f.queues.completions.recv())
            .await
            .unwrap()
            .unwrap();
        f.dispatcher.complete(completion).await;

        let r = f.last();
        assert_eq!(r["id"], 8);
        assert_eq!(r["errno"], ErrorCode::CommandError.code());
        assert!(r["reason"].as_str().unwrap().contains("deferred kaboom"));
    }
}
