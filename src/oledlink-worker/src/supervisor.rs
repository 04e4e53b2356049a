//! Lifecycle of the display worker process.

use crate::channel::{
    spawn_inbound_reader, ChannelOptions, ChannelWriter, InboundHandler, MessageChannel,
};
use crate::error::WorkerError;
use crate::protocol::{HostMessage, StateMessage, WorkerFrame, PROTOCOL_VERSION};
use crate::restart::{restart_delay, wants_restart};
use crate::sink::{LogSink, OutputLine, StreamKind};
use oledlink_core::{ChannelMode, RestartConfig, WorkerConfig};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Environment variable telling the worker how its fd 0 is wired.
pub const CHANNEL_ENV: &str = "OLEDLINK_CHANNEL";
/// Environment variable carrying [`PROTOCOL_VERSION`].
pub const PROTOCOL_ENV: &str = "OLEDLINK_PROTOCOL";

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How to invoke the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub channel: ChannelMode,
}

impl WorkerSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            channel: ChannelMode::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn channel(mut self, channel: ChannelMode) -> Self {
        self.channel = channel;
        self
    }
}

impl From<&WorkerConfig> for WorkerSpec {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            env: config
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            channel: config.channel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub send_timeout: Duration,
    pub stop_grace: Duration,
    pub channel_capacity: usize,
    pub restart: RestartConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for SupervisorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            stop_grace: config.stop_grace(),
            channel_capacity: config.channel_capacity,
            restart: config.restart.clone(),
        }
    }
}

/// Lifecycle of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running { pid: u32 },
    /// Exit code, `None` when the worker was killed by a signal.
    Exited(Option<i32>),
}

impl WorkerState {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerState::Running { .. })
    }
}

/// Passed to the exit observer once per worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The exit followed a `stop` call.
    pub requested: bool,
}

pub type ExitObserver = Arc<dyn Fn(ExitReport) + Send + Sync>;

/// Point-in-time view of the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub spec: Option<WorkerSpec>,
    pub state: WorkerState,
    pub last_exit: Option<SystemTime>,
    pub restarts: u32,
}

/// Owns the display worker: spawns it, routes its output to the sink, writes
/// frames to it and decides what happens when it exits.
///
/// Clones share the same worker. When the last clone is dropped any running
/// worker is killed.
#[derive(Clone)]
pub struct ChildSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    sink: Arc<dyn LogSink>,
    state: watch::Sender<WorkerState>,
    shutdown: watch::Sender<bool>,
    slot: Mutex<Option<WorkerSlot>>,
    spec: Mutex<Option<WorkerSpec>>,
    last_exit: Mutex<Option<SystemTime>>,
    restarts: AtomicU32,
    exit_observer: Mutex<Option<ExitObserver>>,
    inbound: Mutex<Option<InboundHandler>>,
}

/// Handles for one worker process. The `Child` itself lives in the watcher
/// task.
struct WorkerSlot {
    pid: u32,
    channel: Option<MessageChannel>,
    writer: Option<ChannelWriter>,
    readers: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    /// True while the process runs or a restart is pending.
    fn is_active(&self) -> bool {
        self.watcher
            .as_ref()
            .is_some_and(|watcher| !watcher.is_finished())
    }

    fn abort(self) {
        if let Some(writer) = self.writer {
            writer.abort();
        }
        for reader in self.readers {
            reader.abort();
        }
        // Dropping the watcher's future drops the Child, which kills it.
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
    }
}

enum Transport {
    #[cfg(unix)]
    Socket(tokio::net::UnixStream),
    Stdin,
}

impl std::fmt::Debug for ChildSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSupervisor")
            .field("state", &self.state())
            .field("restarts", &self.restarts())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ChildSupervisor {
    pub fn new(config: SupervisorConfig, sink: Arc<dyn LogSink>) -> Self {
        let (state, _) = watch::channel(WorkerState::NotStarted);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                state,
                shutdown,
                slot: Mutex::new(None),
                spec: Mutex::new(None),
                last_exit: Mutex::new(None),
                restarts: AtomicU32::new(0),
                exit_observer: Mutex::new(None),
                inbound: Mutex::new(None),
            }),
        }
    }

    /// Called once per worker process with its exit details.
    pub fn set_exit_observer<F>(&self, observer: F)
    where
        F: Fn(ExitReport) + Send + Sync + 'static,
    {
        *self.inner.exit_observer.lock() = Some(Arc::new(observer));
    }

    /// Receives frames the worker writes back. Takes effect on the next start.
    pub fn set_inbound_handler<F>(&self, handler: F)
    where
        F: Fn(WorkerFrame) + Send + Sync + 'static,
    {
        *self.inner.inbound.lock() = Some(Arc::new(handler));
    }

    /// Spawn the worker and return its pid.
    ///
    /// On failure the lifecycle state is left untouched.
    pub async fn start(&self, spec: WorkerSpec) -> Result<u32, WorkerError> {
        let mut slot = self.inner.slot.lock();
        if slot.as_ref().is_some_and(WorkerSlot::is_active) {
            return Err(WorkerError::AlreadyRunning);
        }

        self.inner.shutdown.send_replace(false);
        self.inner.restarts.store(0, Ordering::SeqCst);
        let launched = self.inner.launch(&spec)?;
        let pid = launched.pid;
        if let Some(previous) = slot.replace(launched) {
            previous.abort();
        }
        *self.inner.spec.lock() = Some(spec);
        Ok(pid)
    }

    /// Queue a message for the worker.
    ///
    /// Fails with `ChannelClosed` when no worker is running and with
    /// `SendTimeout` when the worker stopped reading; either way the message
    /// is dropped and the supervisor keeps going.
    pub async fn send(&self, message: HostMessage) -> Result<(), WorkerError> {
        let channel = {
            let slot = self.inner.slot.lock();
            slot.as_ref().and_then(|slot| slot.channel.clone())
        };
        let Some(channel) = channel else {
            return Err(WorkerError::ChannelClosed { dropped: 1 });
        };
        channel.send(message).await
    }

    pub async fn send_state(&self, state: StateMessage) -> Result<(), WorkerError> {
        self.send(HostMessage::State(state)).await
    }

    /// Stop the worker and release every handle. Safe to call repeatedly.
    ///
    /// Queued frames are flushed and the channel closed; the worker then gets
    /// `stop_grace` to exit before SIGTERM and, after another grace period,
    /// SIGKILL. Pending restarts are cancelled.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.inner.shutdown.send_replace(true);
        let slot = { self.inner.slot.lock().take() };
        let Some(mut slot) = slot else {
            return Ok(());
        };

        let pid = slot.pid;
        let grace = self.inner.config.stop_grace;
        drop(slot.channel.take());

        if let Some(writer) = slot.writer.take() {
            let report = writer.close(grace).await;
            tracing::debug!(
                pid,
                written = report.written,
                dropped = report.dropped,
                "display worker channel closed"
            );
        }

        if let Some(watcher) = slot.watcher.take() {
            if let Err(err) = watcher.await {
                tracing::warn!(pid, error = %err, "display worker watcher failed");
            }
        }

        for mut reader in slot.readers.drain(..) {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }

        tracing::info!(pid, "display worker stopped");
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            WorkerState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    pub fn last_exit(&self) -> Option<SystemTime> {
        *self.inner.last_exit.lock()
    }

    /// Automatic restarts since the last explicit `start`.
    pub fn restarts(&self) -> u32 {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> WorkerProcess {
        WorkerProcess {
            spec: self.inner.spec.lock().clone(),
            state: self.state(),
            last_exit: self.last_exit(),
            restarts: self.restarts(),
        }
    }
}

impl Inner {
    fn launch(self: &Arc<Self>, spec: &WorkerSpec) -> Result<WorkerSlot, WorkerError> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .env(CHANNEL_ENV, spec.channel.as_str())
            .env(PROTOCOL_ENV, PROTOCOL_VERSION.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let transport = match spec.channel {
            ChannelMode::Ipc => {
                let (ours, theirs) = ipc_pair().map_err(WorkerError::ChannelSetup)?;
                command.stdin(theirs);
                ours
            }
            ChannelMode::Stdio => {
                command.stdin(Stdio::piped());
                Transport::Stdin
            }
        };

        let mut child = command.spawn().map_err(|source| WorkerError::Spawn {
            executable: spec.executable.clone(),
            source,
        })?;
        // The command still holds the worker's end of the socket; the inbound
        // reader only sees EOF once it is closed here.
        drop(command);
        let pid = child.id().unwrap_or_default();

        let options = ChannelOptions {
            capacity: self.config.channel_capacity,
            send_timeout: self.config.send_timeout,
        };
        let mut readers = Vec::new();
        let (channel, writer) = match transport {
            #[cfg(unix)]
            Transport::Socket(stream) => {
                let (read_half, write_half) = stream.into_split();
                let handler = self.inbound.lock().clone();
                readers.push(spawn_inbound_reader(read_half, self.sink.clone(), handler));
                MessageChannel::open(write_half, options, self.sink.clone())
            }
            Transport::Stdin => {
                let stdin = child.stdin.take().ok_or_else(|| {
                    WorkerError::ChannelSetup(std::io::Error::other(
                        "worker stdin was not captured",
                    ))
                })?;
                MessageChannel::open(stdin, options, self.sink.clone())
            }
        };

        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_output_reader(
                stdout,
                StreamKind::Stdout,
                self.sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_output_reader(
                stderr,
                StreamKind::Stderr,
                self.sink.clone(),
            ));
        }

        // Running must be published before the watcher can publish Exited.
        self.state.send_replace(WorkerState::Running { pid });
        tracing::info!(
            pid,
            executable = %spec.executable.display(),
            channel = spec.channel.as_str(),
            "display worker started"
        );

        let watcher = tokio::spawn(watch_worker(
            Arc::downgrade(self),
            child,
            pid,
            self.shutdown.subscribe(),
            self.config.stop_grace,
        ));

        Ok(WorkerSlot {
            pid,
            channel: Some(channel),
            writer: Some(writer),
            readers,
            watcher: Some(watcher),
        })
    }

    /// Publish an exit and return the restart delay if the policy wants one.
    fn record_exit(
        &self,
        pid: u32,
        status: std::io::Result<ExitStatus>,
        requested: bool,
    ) -> Option<Duration> {
        let (code, signal) = match status {
            Ok(status) => (status.code(), exit_signal(&status)),
            Err(err) => {
                self.sink.failure(&WorkerError::Wait(err));
                (None, None)
            }
        };

        if let Some(slot) = self.slot.lock().as_mut().filter(|slot| slot.pid == pid) {
            slot.channel = None;
        }
        *self.last_exit.lock() = Some(SystemTime::now());
        self.state.send_replace(WorkerState::Exited(code));

        let requested = requested || *self.shutdown.borrow();
        tracing::info!(pid, code, signal, requested, "display worker exited");

        let observer = self.exit_observer.lock().clone();
        if let Some(observer) = observer {
            observer(ExitReport {
                pid,
                code,
                signal,
                requested,
            });
        }

        if requested {
            return None;
        }
        if code != Some(0) {
            self.sink
                .failure(&WorkerError::UnexpectedExit { code, signal });
        }

        let restart = &self.config.restart;
        if !wants_restart(restart.policy, code) {
            return None;
        }
        let attempt = self.restarts.load(Ordering::SeqCst);
        if attempt >= restart.max_restarts {
            self.sink.failure(&WorkerError::RestartLimit {
                limit: restart.max_restarts,
            });
            return None;
        }
        self.restarts.store(attempt + 1, Ordering::SeqCst);
        Some(restart_delay(restart, attempt))
    }

    fn restart(self: &Arc<Self>) {
        let mut slot = self.slot.lock();
        if *self.shutdown.borrow() {
            return;
        }
        let Some(spec) = self.spec.lock().clone() else {
            return;
        };

        match self.launch(&spec) {
            Ok(launched) => {
                // The previous slot's watcher is the task running this code,
                // so it is dropped rather than aborted.
                drop(slot.replace(launched));
            }
            Err(err) => {
                tracing::error!(error = %err, "display worker restart failed");
                self.sink.failure(&err);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get_mut().take() {
            slot.abort();
        }
    }
}

async fn watch_worker(
    supervisor: Weak<Inner>,
    mut child: Child,
    pid: u32,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = shutdown_requested(&mut shutdown) => None,
    };
    let (status, requested) = match exited {
        Some(status) => (status, false),
        None => (terminate(&mut child, pid, grace).await, true),
    };
    drop(child);

    let delay = match supervisor.upgrade() {
        Some(inner) => inner.record_exit(pid, status, requested),
        None => return,
    };
    let Some(delay) = delay else {
        return;
    };

    tracing::info!(
        pid,
        delay_ms = delay.as_millis() as u64,
        "restarting display worker"
    );
    tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = shutdown_requested(&mut shutdown) => return,
    }

    if let Some(inner) = supervisor.upgrade() {
        inner.restart();
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let requested = *shutdown.borrow_and_update();
        if requested {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Escalate from "channel closed" to SIGTERM to SIGKILL.
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    if send_sigterm(pid) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
    }

    tracing::warn!(pid, "display worker ignored termination request, killing it");
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw_pid) = i32::try_from(pid) else {
        return false;
    };
    if raw_pid <= 0 {
        return false;
    }
    tracing::info!(pid, "display worker still running, sending SIGTERM");
    match kill(Pid::from_raw(raw_pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(pid, error = %err, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn ipc_pair() -> std::io::Result<(Transport, Stdio)> {
    use std::os::fd::OwnedFd;

    let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
    ours.set_nonblocking(true)?;
    let ours = tokio::net::UnixStream::from_std(ours)?;
    Ok((Transport::Socket(ours), Stdio::from(OwnedFd::from(theirs))))
}

#[cfg(not(unix))]
fn ipc_pair() -> std::io::Result<(Transport, Stdio)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "the ipc channel needs Unix sockets; use channel = \"stdio\"",
    ))
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn spawn_output_reader<R>(reader: R, stream: StreamKind, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => sink.line(OutputLine::from_bytes(stream, &buf)),
                Err(err) => {
                    tracing::debug!(stream = stream.as_str(), error = %err, "worker output stream failed");
                    break;
                }
            }
        }
    })
}
