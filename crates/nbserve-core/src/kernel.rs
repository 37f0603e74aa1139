//! Kernel subprocess management.
//!
//! Provides [`ProcessKernel`] for spawning and communicating with one
//! interpreter subprocess over length-prefixed frames, and the
//! [`Kernel`] / [`KernelLauncher`] traits that let sessions run against
//! an injected fake for state-machine tests.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ExecConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    self, ExecutionState, Inbound, KernelMessage, KernelRequest, decode_inbound,
};

/// How long terminate waits for a clean exit before killing.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Command line used to spawn kernel subprocesses.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    /// Interpreter binary.
    pub program: PathBuf,
    /// Arguments passed to the binary.
    pub args: Vec<String>,
}

impl KernelSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Resolve the bundled reference kernel.
    ///
    /// Looks for the `nbserve-kernel` binary in the following order:
    /// 1. `NBSERVE_KERNEL_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. System PATH
    /// 4. For development: `target/debug` or `target/release`
    pub fn resolve_default() -> Result<Self> {
        Ok(Self::new(Self::find_kernel_binary()?, Vec::new()))
    }

    fn kernel_binary_name() -> &'static str {
        if cfg!(windows) {
            "nbserve-kernel.exe"
        } else {
            "nbserve-kernel"
        }
    }

    fn find_kernel_binary() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("NBSERVE_KERNEL_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let candidate = exe_dir.join(Self::kernel_binary_name());
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        if let Ok(path) = which::which(Self::kernel_binary_name()) {
            return Ok(path);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            for profile in &["debug", "release"] {
                let path = PathBuf::from(&manifest_dir)
                    .join("..")
                    .join("..")
                    .join("target")
                    .join(profile)
                    .join(Self::kernel_binary_name());
                if path.exists() {
                    return Ok(path.canonicalize().unwrap_or(path));
                }
            }
        }

        Err(Error::KernelStart(
            "could not find nbserve-kernel binary; set NBSERVE_KERNEL_PATH or ensure it's in PATH"
                .to_string(),
        ))
    }
}

/// Delivers an interrupt signal to a kernel from outside its owning
/// session loop, without touching the kernel's channels.
pub trait Interrupter: Send + Sync {
    /// Deliver the signal. Returns whether delivery happened.
    fn signal(&self) -> bool;
}

/// One live interpreter subprocess, owned exclusively by its session.
pub trait Kernel: Send + 'static {
    /// Write one encoded request. Replies arrive on the broadcast
    /// channel independently.
    fn send(&mut self, request: KernelRequest) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to the kernel's message stream.
    fn subscribe(&self) -> broadcast::Receiver<Inbound>;

    /// Handle for out-of-band interrupt delivery.
    fn interrupter(&self) -> Arc<dyn Interrupter>;

    /// Forcibly end the subprocess: grace period, then kill.
    fn terminate(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Liveness probe.
    fn is_alive(&mut self) -> bool;

    /// Process id, if the kernel is backed by a real process.
    fn pid(&self) -> Option<u32>;
}

/// Starts kernels; the session keeps one around for restarts.
pub trait KernelLauncher: Send + Sync + 'static {
    type Kernel: Kernel;

    /// Spawn a kernel and wait for its readiness signal.
    fn launch(&self) -> impl Future<Output = Result<Self::Kernel>> + Send;
}

/// Interrupter backed by a SIGINT to the kernel's process id.
struct PidInterrupter {
    pid: u32,
}

impl Interrupter for PidInterrupter {
    #[cfg(unix)]
    fn signal(&self) -> bool {
        // SIGINT mirrors what a terminal Ctrl-C delivers; the kernel
        // decides whether the current execution actually aborts.
        let rc = unsafe { libc::kill(self.pid as i32, libc::SIGINT) };
        rc == 0
    }

    #[cfg(not(unix))]
    fn signal(&self) -> bool {
        tracing::warn!(pid = self.pid, "interrupt signal not supported on this platform");
        false
    }
}

/// Handle to a kernel subprocess.
pub struct ProcessKernel {
    child: Child,
    stdin: ChildStdin,
    tx: broadcast::Sender<Inbound>,
    reader: JoinHandle<()>,
    pid: Option<u32>,
    terminated: bool,
}

impl ProcessKernel {
    /// Spawn a kernel from `spec` and wait for its boot `status: idle`.
    ///
    /// Fails with [`Error::KernelStart`] if the process cannot be
    /// spawned or does not signal readiness within
    /// `config.ready_timeout`.
    pub async fn launch(spec: &KernelSpec, config: &ExecConfig) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Kernel stderr passes through for debugging
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::KernelStart(format!(
                    "failed to spawn kernel '{}': {}",
                    spec.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::KernelStart("failed to get kernel stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::KernelStart("failed to get kernel stdout".to_string()))?;

        let (tx, mut ready_rx) = broadcast::channel(config.channel_capacity);
        let pid = child.id();

        let reader_tx = tx.clone();
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            loop {
                match protocol::read_frame(&mut stdout).await {
                    Ok(Some(bytes)) => {
                        // No receivers is fine; messages are only
                        // relevant while an execution is being observed.
                        let _ = reader_tx.send(decode_inbound(&bytes));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("kernel stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        let mut kernel = Self {
            child,
            stdin,
            tx,
            reader,
            pid,
            terminated: false,
        };

        // Readiness: the kernel emits one idle status once it is
        // accepting requests.
        let ready = tokio::time::timeout(config.ready_timeout, async {
            loop {
                match ready_rx.recv().await {
                    Ok(Inbound::Message(KernelMessage::Status {
                        execution_state: ExecutionState::Idle,
                        ..
                    })) => return true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;

        match ready {
            Ok(true) => {
                tracing::info!(pid = ?kernel.pid, kernel = %spec.program.display(), "kernel ready");
                Ok(kernel)
            }
            Ok(false) => {
                let _ = kernel.terminate().await;
                Err(Error::KernelStart(
                    "kernel exited before signaling readiness".to_string(),
                ))
            }
            Err(_) => {
                let _ = kernel.terminate().await;
                Err(Error::KernelStart(format!(
                    "kernel did not signal readiness within {:?}",
                    config.ready_timeout
                )))
            }
        }
    }
}

impl Kernel for ProcessKernel {
    async fn send(&mut self, request: KernelRequest) -> Result<()> {
        if self.terminated {
            return Err(Error::Ipc("kernel has been terminated".to_string()));
        }
        protocol::write_frame(&mut self.stdin, &request).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.tx.subscribe()
    }

    fn interrupter(&self) -> Arc<dyn Interrupter> {
        let pid = self.pid.unwrap_or(0);
        Arc::new(PidInterrupter { pid })
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        // Ask nicely first so the kernel can flush and exit.
        let _ = protocol::write_frame(&mut self.stdin, &KernelRequest::Shutdown).await;

        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?self.pid, %status, "kernel exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, "failed to wait for kernel: {}", e);
            }
            Err(_) => {
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(pid = ?self.pid, "failed to kill kernel: {}", e);
                }
            }
        }

        self.reader.abort();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for ProcessKernel {
    fn drop(&mut self) {
        // kill_on_drop reaps the subprocess; the reader task ends on EOF.
        self.reader.abort();
    }
}

/// Launches [`ProcessKernel`]s from a fixed spec.
pub struct ProcessLauncher {
    spec: KernelSpec,
    config: ExecConfig,
}

impl ProcessLauncher {
    pub fn new(spec: KernelSpec, config: ExecConfig) -> Self {
        Self { spec, config }
    }
}

impl KernelLauncher for ProcessLauncher {
    type Kernel = ProcessKernel;

    async fn launch(&self) -> Result<ProcessKernel> {
        ProcessKernel::launch(&self.spec, &self.config).await
    }
}

/// Scripted in-process kernels for exercising session and coordinator
/// behavior without a subprocess.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::protocol::ReplyStatus;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    /// One scripted event emitted during a fake execution.
    #[derive(Debug, Clone)]
    pub enum FakeEvent {
        Stream(&'static str),
        Result(&'static str),
        Error {
            ename: &'static str,
            evalue: &'static str,
        },
        /// Message tagged with an unrelated msg_id (stale-reply defense).
        Foreign(&'static str),
        /// Undecodable frame.
        Malformed,
    }

    /// Script for one execution request.
    #[derive(Debug, Clone)]
    pub struct FakePlan {
        pub delay: Duration,
        pub events: Vec<FakeEvent>,
        /// `None` means never reply (the execution hangs).
        pub reply: Option<ReplyStatus>,
        /// Simulate the process dying instead of replying.
        pub die: bool,
    }

    impl FakePlan {
        pub fn ok(events: Vec<FakeEvent>) -> Self {
            Self {
                delay: Duration::ZERO,
                events,
                reply: Some(ReplyStatus::Ok),
                die: false,
            }
        }

        pub fn error(ename: &'static str, evalue: &'static str) -> Self {
            Self {
                delay: Duration::ZERO,
                events: vec![FakeEvent::Error { ename, evalue }],
                reply: Some(ReplyStatus::Error),
                die: false,
            }
        }

        pub fn hang() -> Self {
            Self {
                delay: Duration::ZERO,
                events: Vec::new(),
                reply: None,
                die: false,
            }
        }

        pub fn die() -> Self {
            Self {
                delay: Duration::ZERO,
                events: Vec::new(),
                reply: None,
                die: true,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    type PlanFn = dyn Fn(&str) -> FakePlan + Send + Sync;

    pub struct FakeKernel {
        tx_slot: Arc<Mutex<Option<broadcast::Sender<Inbound>>>>,
        plan_for: Arc<PlanFn>,
        alive: Arc<AtomicBool>,
        exec_count: Arc<AtomicU32>,
        /// When set, an interrupt signal makes the kernel emit an idle
        /// status (it "recovered"); otherwise signals are swallowed.
        interrupt_recovers: bool,
    }

    struct FakeInterrupter {
        tx_slot: Arc<Mutex<Option<broadcast::Sender<Inbound>>>>,
        recovers: bool,
        delivered: Arc<AtomicBool>,
    }

    impl Interrupter for FakeInterrupter {
        fn signal(&self) -> bool {
            self.delivered.store(true, Ordering::SeqCst);
            if self.recovers
                && let Some(tx) = self.tx_slot.lock().unwrap().as_ref()
            {
                let _ = tx.send(Inbound::Message(KernelMessage::Status {
                    msg_id: None,
                    execution_state: ExecutionState::Idle,
                }));
            }
            true
        }
    }

    impl Kernel for FakeKernel {
        async fn send(&mut self, request: KernelRequest) -> Result<()> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(Error::Ipc("kernel has been terminated".to_string()));
            }
            let KernelRequest::Execute { msg_id, code } = request else {
                return Ok(());
            };

            let plan = (self.plan_for)(&code);
            let count = self.exec_count.fetch_add(1, Ordering::SeqCst) + 1;
            let tx_slot = self.tx_slot.clone();
            let alive = self.alive.clone();

            tokio::spawn(async move {
                let send = |msg: Inbound| {
                    if let Some(tx) = tx_slot.lock().unwrap().as_ref() {
                        let _ = tx.send(msg);
                    }
                };

                send(Inbound::Message(KernelMessage::Status {
                    msg_id: Some(msg_id.clone()),
                    execution_state: ExecutionState::Busy,
                }));

                if !plan.delay.is_zero() {
                    tokio::time::sleep(plan.delay).await;
                }

                if plan.die {
                    alive.store(false, Ordering::SeqCst);
                    // Dropping the sender closes every subscriber.
                    tx_slot.lock().unwrap().take();
                    return;
                }

                for event in &plan.events {
                    let msg = match event {
                        FakeEvent::Stream(text) => Inbound::Message(KernelMessage::Stream {
                            msg_id: msg_id.clone(),
                            name: crate::protocol::StreamName::Stdout,
                            text: (*text).to_string(),
                        }),
                        FakeEvent::Result(repr) => {
                            Inbound::Message(KernelMessage::ExecuteResult {
                                msg_id: msg_id.clone(),
                                execution_count: count,
                                data: crate::protocol::text_plain(repr),
                            })
                        }
                        FakeEvent::Error { ename, evalue } => {
                            Inbound::Message(KernelMessage::Error {
                                msg_id: msg_id.clone(),
                                ename: (*ename).to_string(),
                                evalue: (*evalue).to_string(),
                                traceback: vec![(*evalue).to_string()],
                            })
                        }
                        FakeEvent::Foreign(repr) => Inbound::Message(KernelMessage::ExecuteResult {
                            msg_id: "stale-request".to_string(),
                            execution_count: 0,
                            data: crate::protocol::text_plain(repr),
                        }),
                        FakeEvent::Malformed => Inbound::Malformed {
                            detail: "unrecognized kernel message".to_string(),
                        },
                    };
                    send(msg);
                }

                if let Some(status) = plan.reply {
                    send(Inbound::Message(KernelMessage::ExecuteReply {
                        msg_id: msg_id.clone(),
                        status,
                        execution_count: Some(count),
                    }));
                    send(Inbound::Message(KernelMessage::Status {
                        msg_id: Some(msg_id),
                        execution_state: ExecutionState::Idle,
                    }));
                }
            });

            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Inbound> {
            match self.tx_slot.lock().unwrap().as_ref() {
                Some(tx) => tx.subscribe(),
                None => {
                    // Dead kernel: hand back an already-closed receiver.
                    let (tx, rx) = broadcast::channel::<Inbound>(1);
                    drop(tx);
                    rx
                }
            }
        }

        fn interrupter(&self) -> Arc<dyn Interrupter> {
            Arc::new(FakeInterrupter {
                tx_slot: self.tx_slot.clone(),
                recovers: self.interrupt_recovers,
                delivered: Arc::new(AtomicBool::new(false)),
            })
        }

        async fn terminate(&mut self) -> Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            self.tx_slot.lock().unwrap().take();
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn pid(&self) -> Option<u32> {
            None
        }
    }

    /// Launcher producing scripted fake kernels. Counts starts so tests
    /// can assert on duplicate-spawn races.
    pub struct FakeLauncher {
        plan_for: Arc<PlanFn>,
        pub starts: Arc<AtomicUsize>,
        /// Fail any launch past this many (0 = fail every launch).
        pub fail_after: Option<usize>,
        pub interrupt_recovers: bool,
        pub start_delay: Duration,
    }

    impl FakeLauncher {
        pub fn new(plan_for: impl Fn(&str) -> FakePlan + Send + Sync + 'static) -> Self {
            Self {
                plan_for: Arc::new(plan_for),
                starts: Arc::new(AtomicUsize::new(0)),
                fail_after: None,
                interrupt_recovers: false,
                start_delay: Duration::ZERO,
            }
        }

        /// Scripted arithmetic kernel: `N+M` yields an execute_result,
        /// `boom` yields an error, `hang` never replies, `die` kills
        /// the process mid-execution.
        pub fn arithmetic() -> Self {
            Self::new(|code| match code {
                "boom" => FakePlan::error("ValueError", "boom"),
                "hang" => FakePlan::hang(),
                "die" => FakePlan::die(),
                "1+1" => FakePlan::ok(vec![FakeEvent::Result("2")]),
                _ => FakePlan::ok(vec![FakeEvent::Result("42")]),
            })
        }

        pub fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    impl KernelLauncher for FakeLauncher {
        type Kernel = FakeKernel;

        async fn launch(&self) -> Result<FakeKernel> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            if let Some(limit) = self.fail_after
                && n >= limit
            {
                return Err(Error::KernelStart("scripted launch failure".to_string()));
            }

            let (tx, _rx) = broadcast::channel(256);
            Ok(FakeKernel {
                tx_slot: Arc::new(Mutex::new(Some(tx))),
                plan_for: self.plan_for.clone(),
                alive: Arc::new(AtomicBool::new(true)),
                exec_count: Arc::new(AtomicU32::new(0)),
                interrupt_recovers: self.interrupt_recovers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_spec_lookup_fails_without_binary() {
        // Guard against a stale env var leaking into the test.
        if std::env::var("NBSERVE_KERNEL_PATH").is_ok() {
            return;
        }
        // The lookup either finds a built binary (dev tree) or reports
        // a start failure naming the env var.
        match KernelSpec::resolve_default() {
            Ok(spec) => assert!(spec.program.exists()),
            Err(Error::KernelStart(msg)) => assert!(msg.contains("NBSERVE_KERNEL_PATH")),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn fake_kernel_replies_in_order() {
        use crate::protocol::ReplyStatus;
        use super::fake::{FakeEvent, FakeLauncher, FakePlan};

        let launcher = FakeLauncher::new(|_| {
            FakePlan::ok(vec![FakeEvent::Stream("out\n"), FakeEvent::Result("2")])
        });
        let mut kernel = launcher.launch().await.unwrap();
        let mut rx = kernel.subscribe();

        kernel
            .send(KernelRequest::Execute {
                msg_id: "m1".to_string(),
                code: "1+1".to_string(),
            })
            .await
            .unwrap();

        let mut kinds = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                Inbound::Message(KernelMessage::ExecuteReply { status, .. }) => {
                    assert_eq!(status, ReplyStatus::Ok);
                    kinds.push("reply");
                    break;
                }
                Inbound::Message(KernelMessage::Stream { .. }) => kinds.push("stream"),
                Inbound::Message(KernelMessage::ExecuteResult { .. }) => kinds.push("result"),
                _ => {}
            }
        }
        assert_eq!(kinds, vec!["stream", "result", "reply"]);
    }
}
