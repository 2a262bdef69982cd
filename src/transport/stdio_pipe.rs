//! Stdin/stdout pipe channel to the worker subprocess.
//!
//! Owns the child process and exchanges length-prefixed JSON frames on
//! the child's stdin (requests) and stdout (responses). The worker's
//! stderr is inherited so its tracing output lands in the
//! orchestrator's stderr stream.
//!
//! The child itself lives inside a monitor task so that exit can be
//! observed while a call is in flight. The monitor reaps the process,
//! flips the exit watch, and kills the child on request (or when the
//! channel is dropped).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{recv_message, send_message, ControlChannel, Frame};
use crate::error::RuntimeError;

/// Control channel backed by a spawned worker process.
pub struct StdioChannel {
    stdin: ChildStdin,
    stdout: ChildStdout,
    exit_rx: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<Option<i32>>>,
}

impl StdioChannel {
    /// Spawn the worker executable with the given working and module
    /// directories and attach to its control channel.
    ///
    /// The handshake is the caller's responsibility; this only gets the
    /// process up with its pipes wired.
    pub fn spawn(
        worker_exec: &Path,
        working_dir: &Path,
        module_dir: &Path,
    ) -> Result<Self, RuntimeError> {
        debug!(exec = %worker_exec.display(), "spawning worker process");

        let mut child = tokio::process::Command::new(worker_exec)
            .arg("--modules-dir")
            .arg(module_dir)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            RuntimeError::Bootstrap("failed to attach to worker stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RuntimeError::Bootstrap("failed to attach to worker stdout".to_string())
        })?;

        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // Dropping the channel drops `kill_tx`, which the monitor
        // treats the same as an explicit kill request.
        let monitor = tokio::spawn(async move {
            let mut code = None;
            let killed = tokio::select! {
                status = child.wait() => {
                    code = status.ok().and_then(|s| s.code());
                    false
                }
                _ = kill_rx => true,
            };
            if killed {
                let _ = child.kill().await;
                code = child.wait().await.ok().and_then(|s| s.code());
            }
            debug!(?code, "worker process exited");
            let _ = exit_tx.send(true);
            code
        });

        Ok(Self {
            stdin,
            stdout,
            exit_rx,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        })
    }

    async fn wait_for_exit_flag(&self) {
        let mut rx = self.exit_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl ControlChannel for StdioChannel {
    async fn send(&mut self, frame: &Frame) -> Result<(), RuntimeError> {
        let payload = frame.encode()?;
        send_message(&mut self.stdin, &payload).await
    }

    async fn recv(&mut self) -> Result<Frame, RuntimeError> {
        let payload = recv_message(&mut self.stdout).await?;
        Frame::decode(&payload)
    }

    async fn wait_exit(&mut self) -> Result<Option<i32>, RuntimeError> {
        self.wait_for_exit_flag().await;
        let code = match self.monitor.take() {
            Some(monitor) => monitor.await.unwrap_or(None),
            None => None,
        };
        Ok(code)
    }

    async fn shutdown(&mut self) {
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
        self.wait_for_exit_flag().await;
        debug!("worker process shut down");
    }

    fn exit_signal(&self) -> Option<watch::Receiver<bool>> {
        Some(self.exit_rx.clone())
    }
}
