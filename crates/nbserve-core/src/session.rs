//! Execution sessions.
//!
//! A [`Session`] owns one kernel and serializes executions against it.
//! Requests queue on an mpsc channel and run strictly in submission
//! order; interrupt and restart travel out-of-band so they can cut an
//! in-flight execution short instead of waiting behind it.
//!
//! State machine: `Starting -> Idle <-> Busy`, with `Busy ->
//! Restarting -> Idle` on timeout or explicit restart, and any state
//! `-> Dead` once a kernel cannot be replaced. Dead sessions reject
//! all further work.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ExecConfig;
use crate::error::{Error, Result};
use crate::kernel::{Interrupter, Kernel, KernelLauncher};
use crate::outputs::{ExecutionResult, ExecutionStatus, OutputAggregator};
use crate::protocol::{ExecutionState, Inbound, KernelMessage, KernelRequest};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Restarting => "restarting",
            SessionState::Dead => "dead",
        };
        f.write_str(s)
    }
}

struct Command {
    code: String,
    timeout: Option<Duration>,
    reply: oneshot::Sender<ExecutionResult>,
}

enum Oob {
    Restart(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// State visible outside the session loop.
struct Shared {
    state: Mutex<SessionState>,
    interrupter: Mutex<Option<Arc<dyn Interrupter>>>,
    last_used: Mutex<Instant>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_interrupter(&self, i: Option<Arc<dyn Interrupter>>) {
        *self.interrupter.lock().unwrap_or_else(|e| e.into_inner()) = i;
    }

    fn signal_interrupt(&self) -> bool {
        let guard = self.interrupter.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(i) => i.signal(),
            None => false,
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to one kernel session. Cheap operations go through shared
/// state; executions queue on the session loop.
pub struct Session {
    path: PathBuf,
    cmd_tx: mpsc::Sender<Command>,
    oob_tx: mpsc::Sender<Oob>,
    shared: Arc<Shared>,
}

impl Session {
    /// Launch a kernel and spawn the session loop for it.
    ///
    /// Fails with [`Error::KernelStart`] when the kernel cannot be
    /// spawned or never signals readiness; no loop is left behind in
    /// that case.
    pub async fn start<L: KernelLauncher>(
        path: impl Into<PathBuf>,
        launcher: Arc<L>,
        config: ExecConfig,
    ) -> Result<Self> {
        let path = path.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::Starting),
            interrupter: Mutex::new(None),
            last_used: Mutex::new(Instant::now()),
        });

        let kernel = launcher.launch().await?;
        shared.set_interrupter(Some(kernel.interrupter()));
        shared.set_state(SessionState::Idle);

        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (oob_tx, oob_rx) = mpsc::channel(8);

        let loop_shared = shared.clone();
        let loop_path = path.clone();
        tokio::spawn(async move {
            SessionLoop {
                path: loop_path,
                kernel,
                launcher,
                config,
                shared: loop_shared,
            }
            .run(cmd_rx, oob_rx)
            .await;
        });

        Ok(Self {
            path,
            cmd_tx,
            oob_tx,
            shared,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Time since the session last started or finished an execution.
    pub fn idle_for(&self) -> Duration {
        self.shared.last_used().elapsed()
    }

    /// Queue one code block and wait for its result.
    ///
    /// `timeout` falls back to the configured default. The returned
    /// result is also produced for cut-short executions (timeout,
    /// interrupt, kernel death); only a dead session yields an error.
    pub async fn execute(
        &self,
        code: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command {
                code: code.into(),
                timeout,
                reply,
            })
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Deliver an interrupt to the running execution, if any.
    ///
    /// Returns whether a signal was actually delivered; an idle or
    /// dead session is a no-op reporting `false`.
    pub fn interrupt(&self) -> bool {
        if self.shared.state() != SessionState::Busy {
            return false;
        }
        self.shared.signal_interrupt()
    }

    /// Replace the kernel with a fresh one, aborting any in-flight
    /// execution. All interpreter state is lost.
    pub async fn restart(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.oob_tx
            .send(Oob::Restart(ack))
            .await
            .map_err(|_| self.unavailable())?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// Terminate the kernel and end the session loop.
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.oob_tx.send(Oob::Shutdown(ack)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn unavailable(&self) -> Error {
        Error::SessionUnavailable {
            path: self.path.clone(),
        }
    }
}

/// Outcome of one dequeued execution, directing the main loop.
enum Flow {
    Continue,
    Stop,
}

struct SessionLoop<L: KernelLauncher> {
    path: PathBuf,
    kernel: L::Kernel,
    launcher: Arc<L>,
    config: ExecConfig,
    shared: Arc<Shared>,
}

impl<L: KernelLauncher> SessionLoop<L> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut oob_rx: mpsc::Receiver<Oob>) {
        loop {
            tokio::select! {
                oob = oob_rx.recv() => match oob {
                    Some(Oob::Restart(ack)) => {
                        let _ = ack.send(self.replace_kernel().await);
                        if self.shared.state() == SessionState::Dead {
                            break;
                        }
                    }
                    Some(Oob::Shutdown(ack)) => {
                        let _ = self.kernel.terminate().await;
                        self.shared.set_state(SessionState::Dead);
                        let _ = ack.send(());
                        break;
                    }
                    // Handle dropped: tear the kernel down.
                    None => {
                        let _ = self.kernel.terminate().await;
                        self.shared.set_state(SessionState::Dead);
                        break;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if matches!(self.execute_one(cmd, &mut oob_rx).await, Flow::Stop) {
                            break;
                        }
                    }
                    None => {
                        let _ = self.kernel.terminate().await;
                        self.shared.set_state(SessionState::Dead);
                        break;
                    }
                },
            }
        }

        self.shared.set_interrupter(None);
        // Unanswered queued requests resolve as unavailable when their
        // reply senders drop with the receiver.
        cmd_rx.close();
        tracing::debug!(path = %self.path.display(), "session loop ended");
    }

    /// Run one queued execution to completion, cutting it short on
    /// timeout, restart request, or kernel death.
    async fn execute_one(&mut self, cmd: Command, oob_rx: &mut mpsc::Receiver<Oob>) -> Flow {
        self.shared.touch();

        // A kernel that died while idle gets replaced before the next
        // execution rather than failing it.
        if !self.kernel.is_alive() {
            tracing::warn!(path = %self.path.display(), "kernel died while idle, restarting");
            if self.replace_kernel().await.is_err() {
                return Flow::Stop;
            }
        }

        let msg_id = Uuid::new_v4().to_string();
        let timeout = cmd.timeout.unwrap_or(self.config.default_timeout);
        let mut rx = self.kernel.subscribe();
        let mut agg = OutputAggregator::new(&msg_id);

        self.shared.set_state(SessionState::Busy);
        let started = Instant::now();
        tracing::debug!(path = %self.path.display(), %msg_id, ?timeout, "execution started");

        if let Err(e) = self
            .kernel
            .send(KernelRequest::Execute {
                msg_id: msg_id.clone(),
                code: cmd.code,
            })
            .await
        {
            tracing::warn!(path = %self.path.display(), "failed to send execute request: {}", e);
            let result = agg.finish(ExecutionStatus::Interrupted, started.elapsed());
            let _ = cmd.reply.send(result);
            return flow_after(self.replace_kernel().await);
        }

        let deadline = started + timeout;
        // Set once the execution is being cut short.
        let mut cut: Option<ExecutionStatus> = None;
        // Interrupt delivered; give the kernel this long to settle.
        let mut grace_deadline: Option<Instant> = None;
        // Kernel went idle without a reply after an interrupt.
        let mut recovered = false;
        let mut restart_acks: Vec<oneshot::Sender<Result<()>>> = Vec::new();
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

        let replied = loop {
            let wake = match (cut, grace_deadline) {
                (None, _) => deadline,
                (Some(_), Some(g)) => g,
                // Forced cut (restart/shutdown): stop immediately.
                (Some(_), None) => break false,
            };

            tokio::select! {
                biased;

                item = rx.recv() => match item {
                    Ok(inbound) => {
                        if agg.absorb(&inbound) {
                            break true;
                        }
                        if cut.is_some() && is_idle_status(&inbound) {
                            recovered = true;
                            break false;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(path = %self.path.display(), skipped = n, "kernel channel lagged");
                        agg.record_lost(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Kernel death resolves the in-flight request
                        // as interrupted.
                        cut = Some(ExecutionStatus::Interrupted);
                        break false;
                    }
                },

                oob = oob_rx.recv() => match oob {
                    Some(Oob::Restart(ack)) => {
                        cut = Some(ExecutionStatus::Interrupted);
                        grace_deadline = None;
                        restart_acks.push(ack);
                    }
                    Some(Oob::Shutdown(ack)) => {
                        cut = Some(ExecutionStatus::Interrupted);
                        grace_deadline = None;
                        shutdown_ack = Some(ack);
                    }
                    None => {
                        cut = Some(ExecutionStatus::Interrupted);
                        grace_deadline = None;
                    }
                },

                _ = tokio::time::sleep_until(wake) => {
                    if cut.is_none() {
                        tracing::warn!(path = %self.path.display(), %msg_id, ?timeout, "execution timed out, interrupting");
                        cut = Some(ExecutionStatus::Timeout);
                        if self.shared.signal_interrupt() {
                            grace_deadline = Some(Instant::now() + self.config.interrupt_grace);
                        }
                        // Undeliverable interrupt: restart right away.
                    } else {
                        tracing::warn!(path = %self.path.display(), %msg_id, "kernel unresponsive after interrupt");
                        break false;
                    }
                },
            }
        };

        let mut result = agg.finish(
            cut.unwrap_or(ExecutionStatus::Interrupted),
            started.elapsed(),
        );
        // A kernel honoring the interrupt replies (typically with an
        // interrupt error) inside the grace window; the caller still
        // sees the execution as timed out.
        if cut == Some(ExecutionStatus::Timeout) {
            result.status = ExecutionStatus::Timeout;
        }
        let status = result.status;
        let _ = cmd.reply.send(result);
        self.shared.touch();
        tracing::debug!(path = %self.path.display(), %msg_id, ?status, "execution finished");

        if let Some(ack) = shutdown_ack {
            let _ = self.kernel.terminate().await;
            self.shared.set_state(SessionState::Dead);
            let _ = ack.send(());
            return Flow::Stop;
        }

        if !restart_acks.is_empty() {
            let outcome = self.replace_kernel().await;
            for ack in restart_acks {
                let _ = ack.send(match &outcome {
                    Ok(()) => Ok(()),
                    Err(_) => Err(self.unavailable()),
                });
            }
            return flow_after(outcome);
        }

        // Kernel survives a completed reply or a clean post-interrupt
        // idle; anything else gets a fresh process.
        let healthy = replied || recovered;
        if healthy && self.kernel.is_alive() {
            self.shared.set_state(SessionState::Idle);
            Flow::Continue
        } else {
            flow_after(self.replace_kernel().await)
        }
    }

    async fn replace_kernel(&mut self) -> Result<()> {
        self.shared.set_state(SessionState::Restarting);
        self.shared.set_interrupter(None);
        let _ = self.kernel.terminate().await;

        match self.launcher.launch().await {
            Ok(kernel) => {
                self.kernel = kernel;
                self.shared.set_interrupter(Some(self.kernel.interrupter()));
                self.shared.set_state(SessionState::Idle);
                tracing::info!(path = %self.path.display(), "kernel restarted");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Dead);
                tracing::error!(path = %self.path.display(), "kernel restart failed: {}", e);
                Err(e)
            }
        }
    }

    fn unavailable(&self) -> Error {
        Error::SessionUnavailable {
            path: self.path.clone(),
        }
    }
}

fn flow_after(outcome: Result<()>) -> Flow {
    match outcome {
        Ok(()) => Flow::Continue,
        Err(_) => Flow::Stop,
    }
}

fn is_idle_status(inbound: &Inbound) -> bool {
    matches!(
        inbound,
        Inbound::Message(KernelMessage::Status {
            execution_state: ExecutionState::Idle,
            ..
        })
    )
}
