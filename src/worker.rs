//! Process endpoint: the event loop inside the worker subprocess.
//!
//! Receives protocol frames on the control channel, dispatches strictly
//! by operator, and replies. Process-wide state is the client id (set
//! once by the handshake) and the result table. One frame is handled at
//! a time; there is no internal parallelism.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::plugin::{PluginDescriptor, PluginLoader};
use crate::reference::{ResultRef, ResultTable};
use crate::transport::protocol::{EVENT_DESTROY, EVENT_HANDSHAKE, EVENT_START};
use crate::transport::{recv_message, send_message, Frame, Operator};

/// Outcome of handling one inbound frame.
enum Step {
    /// Send this response frame and keep serving.
    Reply(Frame),
    /// Terminate the serve loop; process exit is the observable effect.
    Exit,
}

/// Worker-side endpoint state plus its plugin loader.
pub struct Endpoint<L> {
    client_id: Option<String>,
    results: ResultTable,
    loader: L,
}

impl<L: PluginLoader> Endpoint<L> {
    pub fn new(loader: L) -> Self {
        Self {
            client_id: None,
            results: ResultTable::new(),
            loader,
        }
    }

    /// Serve frames from `reader`, writing responses to `writer`, until
    /// a destroy request arrives or the orchestrator side goes away.
    pub async fn serve<R, W>(mut self, mut reader: R, mut writer: W) -> Result<(), RuntimeError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let payload = match recv_message(&mut reader).await {
                Ok(payload) => payload,
                // Orchestrator closed the channel; nothing left to serve.
                Err(RuntimeError::ProcessCrash) => {
                    info!("control channel closed, exiting");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let frame = match Frame::decode(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "discarding undecodable frame");
                    continue;
                }
            };

            match self.handle(frame).await {
                Step::Reply(response) => {
                    let bytes = response.encode()?;
                    match send_message(&mut writer, &bytes).await {
                        Ok(()) => {}
                        Err(RuntimeError::ProcessCrash) => {
                            info!("control channel closed, exiting");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Step::Exit => {
                    info!("destroy requested, exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(&mut self, frame: Frame) -> Step {
        let operator = frame.operator;
        let event = frame.message.event.as_str();
        debug!(?operator, event, "handling frame");

        match (operator, event) {
            (Operator::Start, EVENT_HANDSHAKE) => self.handshake(&frame.message.params),
            (Operator::Write, EVENT_START) => self.plugin_start(&frame.message.params).await,
            (Operator::Write, EVENT_DESTROY) => Step::Exit,
            (Operator::Read, _) => self.read(&frame.message.params),
            // Reserved operator: acknowledged, never acted on.
            (Operator::Compile, _) => Step::Reply(Frame::pong(Operator::Compile, vec![])),
            (op, event) => Step::Reply(Frame::error(
                op,
                &format!("unexpected event '{event}' for operator {op:?}"),
            )),
        }
    }

    /// `Start`/`handshake`: record the client id and echo it back. This
    /// is the only path that makes the endpoint servable.
    fn handshake(&mut self, params: &[Value]) -> Step {
        let Some(id) = params.first().and_then(Value::as_str) else {
            return Step::Reply(Frame::error(
                Operator::Start,
                "handshake requires a client id param",
            ));
        };
        info!(client_id = %id, "handshake complete");
        self.client_id = Some(id.to_string());
        Step::Reply(Frame::pong(Operator::Start, vec![Value::String(id.to_string())]))
    }

    /// `Write`/`start`: resolve reference-shaped args, invoke the
    /// plugin, and reply with a fresh reference id when it produced a
    /// value. Plugin failures are reported back as an `error` response
    /// so the orchestrator fails the call instead of hanging.
    async fn plugin_start(&mut self, params: &[Value]) -> Step {
        if self.client_id.is_none() {
            return Step::Reply(Frame::error(
                Operator::Write,
                "handshake has not completed",
            ));
        }

        let Some((first, args)) = params.split_first() else {
            return Step::Reply(Frame::error(
                Operator::Write,
                "start requires a plugin descriptor param",
            ));
        };

        let descriptor: PluginDescriptor = match serde_json::from_value(first.clone()) {
            Ok(d) => d,
            Err(e) => {
                return Step::Reply(Frame::error(
                    Operator::Write,
                    &format!("malformed plugin descriptor: {e}"),
                ));
            }
        };

        let resolved: Vec<Value> = args.iter().map(|a| self.results.resolve(a)).collect();

        info!(plugin = %descriptor.name, version = %descriptor.version, args = resolved.len(), "invoking plugin");

        match self.loader.invoke(&descriptor, &resolved).await {
            Ok(Some(value)) if !value.is_null() => {
                let reference = self.results.insert(value);
                Step::Reply(Frame::pong(
                    Operator::Write,
                    vec![Value::String(reference.id.to_string())],
                ))
            }
            Ok(_) => Step::Reply(Frame::pong(Operator::Write, vec![])),
            Err(e) => {
                warn!(plugin = %descriptor.name, error = %e, "plugin invocation failed");
                Step::Reply(Frame::error(Operator::Write, &e.to_string()))
            }
        }
    }

    /// `Read`: resolve a reference back into its concrete value,
    /// replied as a JSON-encoded string.
    fn read(&self, params: &[Value]) -> Step {
        let [param] = params else {
            return Step::Reply(Frame::error(
                Operator::Read,
                &format!("read requires exactly one param, got {}", params.len()),
            ));
        };

        let Some(reference) = ResultRef::from_value(param) else {
            return Step::Reply(Frame::error(Operator::Read, "param is not a result reference"));
        };

        match self.results.get(reference.id) {
            Some(value) => match serde_json::to_string(value) {
                Ok(encoded) => Step::Reply(Frame::pong(Operator::Read, vec![Value::String(encoded)])),
                Err(e) => Step::Reply(Frame::error(Operator::Read, &format!("encode failed: {e}"))),
            },
            None => Step::Reply(Frame::error(
                Operator::Read,
                &format!("unknown result reference {}", reference.id),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use crate::transport::protocol::{EVENT_ERROR, EVENT_PONG};

    /// Loader that runs a closure instead of touching dynamic libraries.
    struct MockLoader<F>(F);

    #[async_trait]
    impl<F> PluginLoader for MockLoader<F>
    where
        F: FnMut(&PluginDescriptor, &[Value]) -> Result<Option<Value>, RuntimeError> + Send,
    {
        async fn invoke(
            &mut self,
            descriptor: &PluginDescriptor,
            args: &[Value],
        ) -> Result<Option<Value>, RuntimeError> {
            (self.0)(descriptor, args)
        }
    }

    fn descriptor_param(name: &str) -> Value {
        json!({"name": name, "version": "1.0.0"})
    }

    fn handshaken<F>(f: F) -> Endpoint<MockLoader<F>>
    where
        F: FnMut(&PluginDescriptor, &[Value]) -> Result<Option<Value>, RuntimeError> + Send,
    {
        let mut endpoint = Endpoint::new(MockLoader(f));
        endpoint.client_id = Some("client".to_string());
        endpoint
    }

    fn reply(step: Step) -> Frame {
        match step {
            Step::Reply(frame) => frame,
            Step::Exit => panic!("expected a reply, got exit"),
        }
    }

    #[tokio::test]
    async fn handshake_echoes_client_id() {
        let mut endpoint = Endpoint::new(MockLoader(|_: &PluginDescriptor, _: &[Value]| Ok(None)));
        let frame = Frame::request(Operator::Start, EVENT_HANDSHAKE, vec![json!("abc-123")]);

        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.operator, Operator::Start);
        assert_eq!(response.message.event, EVENT_PONG);
        assert_eq!(response.message.params, vec![json!("abc-123")]);
        assert_eq!(endpoint.client_id.as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn write_before_handshake_is_refused() {
        let mut endpoint = Endpoint::new(MockLoader(|_: &PluginDescriptor, _: &[Value]| {
            panic!("loader must not run before handshake")
        }));
        let frame = Frame::request(Operator::Write, EVENT_START, vec![descriptor_param("a")]);

        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_ERROR);
    }

    #[tokio::test]
    async fn plugin_returning_value_yields_reference_id() {
        let mut endpoint = handshaken(|_, _| Ok(Some(json!({"y": 2}))));
        let frame = Frame::request(Operator::Write, EVENT_START, vec![descriptor_param("a")]);

        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_PONG);
        assert_eq!(response.message.params.len(), 1);

        let id: Uuid = response.message.params[0].as_str().unwrap().parse().unwrap();
        assert_eq!(endpoint.results.get(id), Some(&json!({"y": 2})));
    }

    #[tokio::test]
    async fn plugin_returning_nothing_yields_empty_pong() {
        let mut endpoint = handshaken(|_, _| Ok(None));
        let frame = Frame::request(Operator::Write, EVENT_START, vec![descriptor_param("a")]);

        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_PONG);
        assert!(response.message.params.is_empty());
        assert!(endpoint.results.is_empty());
    }

    #[tokio::test]
    async fn plugin_returning_null_counts_as_nothing() {
        let mut endpoint = handshaken(|_, _| Ok(Some(Value::Null)));
        let frame = Frame::request(Operator::Write, EVENT_START, vec![descriptor_param("a")]);

        let response = reply(endpoint.handle(frame).await);
        assert!(response.message.params.is_empty());
    }

    #[tokio::test]
    async fn plugin_failure_is_reported_not_swallowed() {
        let mut endpoint =
            handshaken(|_, _| Err(RuntimeError::Plugin("tensor shape mismatch".to_string())));
        let frame = Frame::request(Operator::Write, EVENT_START, vec![descriptor_param("a")]);

        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_ERROR);
        let message = response.message.params[0].as_str().unwrap();
        assert!(message.contains("tensor shape mismatch"));
    }

    #[tokio::test]
    async fn reference_args_are_resolved_and_misses_stay_literal() {
        let mut endpoint = handshaken(|_, args| Ok(Some(json!(args.to_vec()))));
        let stored = endpoint.results.insert(json!({"rows": 10}));
        let dangling = ResultRef::new(Uuid::new_v4()).to_value();

        let frame = Frame::request(
            Operator::Write,
            EVENT_START,
            vec![
                descriptor_param("a"),
                stored.to_value(),
                dangling.clone(),
                json!(7),
            ],
        );
        let response = reply(endpoint.handle(frame).await);
        let id: Uuid = response.message.params[0].as_str().unwrap().parse().unwrap();

        // The plugin observed the stored value, the dangling ref as a
        // literal, and the plain literal untouched.
        assert_eq!(
            endpoint.results.get(id),
            Some(&json!([{"rows": 10}, dangling, 7]))
        );
    }

    #[tokio::test]
    async fn read_returns_json_encoded_value() {
        let mut endpoint = handshaken(|_, _| Ok(None));
        let reference = endpoint.results.insert(json!({"y": 2}));

        let frame = Frame::request(Operator::Read, "valueOf", vec![reference.to_value()]);
        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_PONG);

        let encoded = response.message.params[0].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(encoded).unwrap(), json!({"y": 2}));
    }

    #[tokio::test]
    async fn read_with_wrong_arity_fails() {
        let mut endpoint = handshaken(|_, _| Ok(None));
        let frame = Frame::request(Operator::Read, "valueOf", vec![]);
        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_ERROR);
    }

    #[tokio::test]
    async fn read_of_unknown_reference_fails() {
        let mut endpoint = handshaken(|_, _| Ok(None));
        let dangling = ResultRef::new(Uuid::new_v4());
        let frame = Frame::request(Operator::Read, "valueOf", vec![dangling.to_value()]);
        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.message.event, EVENT_ERROR);
    }

    #[tokio::test]
    async fn compile_is_a_recognized_noop() {
        let mut endpoint = handshaken(|_, _| Ok(None));
        let frame = Frame::request(Operator::Compile, "compile", vec![]);
        let response = reply(endpoint.handle(frame).await);
        assert_eq!(response.operator, Operator::Compile);
        assert_eq!(response.message.event, EVENT_PONG);
    }

    #[tokio::test]
    async fn destroy_exits_without_reply() {
        let mut endpoint = handshaken(|_, _| Ok(None));
        let frame = Frame::request(Operator::Write, EVENT_DESTROY, vec![]);
        assert!(matches!(endpoint.handle(frame).await, Step::Exit));
    }

    #[tokio::test]
    async fn serve_loop_over_duplex_channel() {
        let (orchestrator_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (mut our_read, mut our_write) = tokio::io::split(orchestrator_side);

        let endpoint = Endpoint::new(MockLoader(|_: &PluginDescriptor, _: &[Value]| {
            Ok(Some(json!("produced")))
        }));
        let server = tokio::spawn(endpoint.serve(worker_read, worker_write));

        // Handshake, then a plugin start, then destroy.
        for frame in [
            Frame::request(Operator::Start, EVENT_HANDSHAKE, vec![json!("c1")]),
            Frame::request(Operator::Write, EVENT_START, vec![descriptor_param("a")]),
        ] {
            send_message(&mut our_write, &frame.encode().unwrap()).await.unwrap();
            let payload = recv_message(&mut our_read).await.unwrap();
            let response = Frame::decode(&payload).unwrap();
            assert_eq!(response.message.event, EVENT_PONG);
        }

        let destroy = Frame::request(Operator::Write, EVENT_DESTROY, vec![]);
        send_message(&mut our_write, &destroy.encode().unwrap()).await.unwrap();

        server.await.unwrap().unwrap();
    }
}
