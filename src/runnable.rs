//! Orchestrator-side handle to one managed worker subprocess.
//!
//! A runnable owns its working directory, the control channel to its
//! worker, and the `Init/Idle/Busy/Exited` state machine. The busy gate
//! is the only concurrency control: at most one request is in flight
//! per runnable, so responses are matched to calls by operator alone.
//! Crash and timeout are fatal — the worker is killed and the working
//! directory reclaimed on every exit path, including an unrequested
//! process death.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::plugin::PluginDescriptor;
use crate::reference::ResultRef;
use crate::transport::protocol::{
    EVENT_DESTROY, EVENT_ERROR, EVENT_HANDSHAKE, EVENT_PONG, EVENT_START,
};
use crate::transport::{ControlChannel, Frame, Operator, StdioChannel};

/// Reference-resolution request event (operator `Read`).
const EVENT_VALUE_OF: &str = "valueOf";

/// Lifecycle state of a runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed; no worker spawned yet.
    Init,
    /// Worker up, handshake done, no call in flight.
    Idle,
    /// Exactly one call in flight.
    Busy,
    /// Terminal: destroyed, crashed, or timed out. Not reusable.
    Exited,
}

/// One managed worker subprocess.
pub struct Runnable {
    id: Uuid,
    working_dir: PathBuf,
    module_dir: PathBuf,
    config: RuntimeConfig,
    state: Arc<StdMutex<State>>,
    channel: Mutex<Option<Box<dyn ControlChannel>>>,
}

impl Runnable {
    pub(crate) fn new(config: RuntimeConfig) -> Self {
        let id = Uuid::new_v4();
        let working_dir = config.working_dir(&id.to_string());
        let module_dir = working_dir.join("modules");
        Self {
            id,
            working_dir,
            module_dir,
            config,
            state: Arc::new(StdMutex::new(State::Init)),
            channel: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.lock_state()
    }

    /// Spawn the worker subprocess and perform the handshake.
    ///
    /// On success the runnable is `Idle` and ready for `start` calls.
    /// On failure it is unusable and must be discarded; retry with a
    /// fresh runnable if wanted.
    pub async fn bootstrap(&self) -> Result<(), RuntimeError> {
        match self.spawn_worker().await {
            Ok(channel) => self.bootstrap_with_channel(channel).await,
            Err(e) => {
                // Nothing to kill yet; still reclaim the directory.
                self.set_state(State::Exited);
                self.remove_working_dir().await;
                Err(RuntimeError::Bootstrap(format!("worker spawn failed: {e}")))
            }
        }
    }

    async fn spawn_worker(&self) -> Result<Box<dyn ControlChannel>, RuntimeError> {
        let worker_exec = self.config.resolved_worker_exec()?;
        tokio::fs::create_dir_all(&self.module_dir).await?;
        let channel = StdioChannel::spawn(&worker_exec, &self.working_dir, &self.module_dir)?;
        Ok(Box::new(channel))
    }

    /// Handshake over an already attached control channel.
    async fn bootstrap_with_channel(
        &self,
        channel: Box<dyn ControlChannel>,
    ) -> Result<(), RuntimeError> {
        tokio::fs::create_dir_all(&self.module_dir)
            .await
            .map_err(|e| RuntimeError::Bootstrap(format!("module directory: {e}")))?;

        {
            let mut state = self.lock_state();
            if *state != State::Init {
                return Err(RuntimeError::Bootstrap(format!(
                    "runnable is {:?}, not Init",
                    *state
                )));
            }
            // Hold off marking Idle until the handshake lands.
            *state = State::Busy;
        }

        *self.channel.lock().await = Some(channel);

        let client_id = self.id.to_string();
        let outcome = self
            .exchange(
                Operator::Start,
                EVENT_HANDSHAKE,
                vec![Value::String(client_id.clone())],
                self.config.handshake_timeout(),
            )
            .await;

        match outcome {
            Ok(params) if params.first().and_then(Value::as_str) == Some(client_id.as_str()) => {
                self.set_state(State::Idle);
                if let Some(exit) = self.channel.lock().await.as_ref().and_then(|c| c.exit_signal())
                {
                    self.spawn_exit_observer(exit);
                }
                info!(runnable = %self.id, "bootstrap complete");
                Ok(())
            }
            Ok(params) => {
                self.reap().await;
                Err(RuntimeError::Bootstrap(format!(
                    "handshake pong did not echo the client id: {params:?}"
                )))
            }
            Err(e) => {
                self.reap().await;
                Err(RuntimeError::Bootstrap(e.to_string()))
            }
        }
    }

    /// Invoke a plugin in the worker.
    ///
    /// Any argument may be the wire form of a [`ResultRef`] from an
    /// earlier `start` on the same runnable; the worker resolves it
    /// before the plugin sees it. Returns `None` when the plugin
    /// produced nothing, otherwise a reference to the produced value.
    pub async fn start(
        &self,
        descriptor: &PluginDescriptor,
        args: Vec<Value>,
    ) -> Result<Option<ResultRef>, RuntimeError> {
        self.enter_busy()?;
        let result = self.start_call(descriptor, args).await;
        self.finish_call(result).await
    }

    async fn start_call(
        &self,
        descriptor: &PluginDescriptor,
        args: Vec<Value>,
    ) -> Result<Option<ResultRef>, RuntimeError> {
        self.link_plugin(&descriptor.name).await?;

        let mut params = vec![serde_json::to_value(descriptor).map_err(|e| RuntimeError::codec(&e))?];
        params.extend(args);

        let reply = self
            .exchange(
                Operator::Write,
                EVENT_START,
                params,
                self.config.request_timeout(),
            )
            .await?;

        match reply.as_slice() {
            [] => Ok(None),
            [id] => {
                let id = id
                    .as_str()
                    .and_then(|s| s.parse::<Uuid>().ok())
                    .ok_or_else(|| {
                        RuntimeError::Protocol(format!("start pong carried a malformed id: {id}"))
                    })?;
                Ok(Some(ResultRef::new(id)))
            }
            params => Err(RuntimeError::Protocol(format!(
                "start pong carried {} params, expected at most one",
                params.len()
            ))),
        }
    }

    /// Pull the concrete value behind a reference back across the
    /// process boundary.
    pub async fn value_of(&self, reference: ResultRef) -> Result<Value, RuntimeError> {
        self.enter_busy()?;
        let result = self.value_of_call(reference).await;
        self.finish_call(result).await
    }

    async fn value_of_call(&self, reference: ResultRef) -> Result<Value, RuntimeError> {
        let reply = self
            .exchange(
                Operator::Read,
                EVENT_VALUE_OF,
                vec![reference.to_value()],
                self.config.request_timeout(),
            )
            .await?;

        let [encoded] = reply.as_slice() else {
            return Err(RuntimeError::Protocol(format!(
                "read pong carried {} params, expected exactly one",
                reply.len()
            )));
        };
        let encoded = encoded.as_str().ok_or_else(|| {
            RuntimeError::Protocol("read pong param is not a string".to_string())
        })?;
        serde_json::from_str(encoded).map_err(|e| RuntimeError::codec(&e))
    }

    /// Two-phase shutdown: signal intent with a destroy frame (no reply
    /// expected), wait for the independent exit notification (kill on
    /// timeout), then reclaim the working directory. Terminal.
    pub async fn destroy(&self) -> Result<(), RuntimeError> {
        {
            let mut state = self.lock_state();
            match *state {
                State::Busy => return Err(RuntimeError::Busy),
                State::Exited => return Ok(()),
                State::Init | State::Idle => *state = State::Exited,
            }
        }

        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_mut() {
            // Fire and forget; termination is the observable effect.
            let _ = channel
                .send(&Frame::request(Operator::Write, EVENT_DESTROY, vec![]))
                .await;

            let exited = tokio::time::timeout(self.config.shutdown_timeout(), channel.wait_exit());
            if exited.await.is_err() {
                warn!(runnable = %self.id, "worker did not exit in time, killing");
                channel.shutdown().await;
            }
        }
        *guard = None;
        drop(guard);

        self.remove_working_dir().await;
        info!(runnable = %self.id, "destroyed");
        Ok(())
    }

    /// Send one request and wait for its matching response.
    ///
    /// Inbound frames with a different operator are discarded; the busy
    /// gate guarantees they can only be spurious echoes of another
    /// operator class, never another call's response. The matching
    /// frame's event must be `pong`; `error` becomes a typed failure.
    async fn exchange(
        &self,
        operator: Operator,
        event: &str,
        params: Vec<Value>,
        deadline: std::time::Duration,
    ) -> Result<Vec<Value>, RuntimeError> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or(RuntimeError::ProcessCrash)?;

        channel.send(&Frame::request(operator, event, params)).await?;

        let wait = async {
            loop {
                let frame = channel.recv().await?;
                if frame.operator != operator {
                    debug!(got = ?frame.operator, want = ?operator, "discarding mismatched frame");
                    continue;
                }
                return match frame.message.event.as_str() {
                    EVENT_PONG => Ok(frame.message.params),
                    EVENT_ERROR => {
                        let message = frame
                            .message
                            .params
                            .first()
                            .and_then(Value::as_str)
                            .unwrap_or("unspecified worker error")
                            .to_string();
                        // A Write failure is the plugin's; everything
                        // else broke the protocol contract.
                        if operator == Operator::Write {
                            Err(RuntimeError::Plugin(message))
                        } else {
                            Err(RuntimeError::Protocol(message))
                        }
                    }
                    other => Err(RuntimeError::Protocol(format!(
                        "expected pong, got event '{other}'"
                    ))),
                };
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(deadline)),
        }
    }

    /// Materialize `install_dir/<name>` as a symlink inside this
    /// runnable's private module directory so the worker resolves the
    /// plugin as if locally installed. Read-only reference creation:
    /// many runnables may link the same install concurrently.
    async fn link_plugin(&self, name: &str) -> Result<(), RuntimeError> {
        let source = self.config.installed_plugin_dir(name);
        let dest = self.module_dir.join(name);
        match tokio::fs::symlink(&source, &dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(RuntimeError::Io(e)),
        }
    }

    fn enter_busy(&self) -> Result<(), RuntimeError> {
        let mut state = self.lock_state();
        match *state {
            State::Idle => {
                *state = State::Busy;
                Ok(())
            }
            State::Busy => Err(RuntimeError::Busy),
            State::Init => Err(RuntimeError::Protocol(
                "runnable has not been bootstrapped".to_string(),
            )),
            State::Exited => Err(RuntimeError::ProcessCrash),
        }
    }

    /// Leave the busy state according to how the call went: crash and
    /// timeout are fatal to the runnable, anything else returns to idle.
    ///
    /// A pipe-class I/O failure from the channel is the worker dying
    /// under us (e.g. before the request frame was even written), so it
    /// is normalized to `ProcessCrash` before the state decision.
    async fn finish_call<T>(&self, result: Result<T, RuntimeError>) -> Result<T, RuntimeError> {
        let result = match result {
            Err(RuntimeError::Io(e)) if crate::error::is_disconnect_kind(e.kind()) => {
                Err(RuntimeError::ProcessCrash)
            }
            other => other,
        };
        match &result {
            Err(RuntimeError::ProcessCrash | RuntimeError::Timeout(_)) => self.reap().await,
            _ => {
                // The exit observer may have gone terminal meanwhile.
                let mut state = self.lock_state();
                if *state == State::Busy {
                    *state = State::Idle;
                }
            }
        }
        result
    }

    /// Terminal cleanup: kill the worker if present, drop the channel,
    /// and reclaim the working directory.
    async fn reap(&self) {
        self.set_state(State::Exited);
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_mut() {
            channel.shutdown().await;
        }
        *guard = None;
        drop(guard);
        self.remove_working_dir().await;
    }

    /// Watch the channel's exit signal so a worker dying with no call
    /// in flight still drives the runnable to `Exited` and reclaims its
    /// working directory. Exercised only when the channel carries an
    /// independent exit notification.
    fn spawn_exit_observer(&self, mut exit: watch::Receiver<bool>) {
        let id = self.id;
        let state = Arc::clone(&self.state);
        let working_dir = self.working_dir.clone();
        tokio::spawn(async move {
            while !*exit.borrow_and_update() {
                if exit.changed().await.is_err() {
                    // Sender dropped without firing: the channel was
                    // torn down by a foreground path that owns cleanup.
                    return;
                }
            }
            let was_live = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if *state == State::Exited {
                    false
                } else {
                    *state = State::Exited;
                    true
                }
            };
            if was_live {
                warn!(runnable = %id, "worker exited unrequested");
                remove_dir(id, &working_dir).await;
            }
        });
    }

    async fn remove_working_dir(&self) {
        remove_dir(self.id, &self.working_dir).await;
    }

    fn set_state(&self, next: State) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn remove_dir(id: Uuid, working_dir: &Path) {
    match tokio::fs::remove_dir_all(working_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(runnable = %id, error = %e, "failed to remove working directory");
        }
    }
}
