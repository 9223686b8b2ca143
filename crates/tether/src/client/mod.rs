//! Process supervisor for plugin subprocesses.
//!
//! A [`PluginClient`] owns one plugin process for its whole lifetime: it
//! spawns the executable, reads the handshake line off the child's stdout,
//! forwards the child's stderr, dials the announced address on demand, and
//! guarantees termination: graceful first, forced if the plugin does not
//! exit within the grace window.
//!
//! All supervisor-owned tasks are tracked so [`PluginClient::kill`] can join
//! them; the stderr forwarder is additionally tracked on its own so the
//! reaper can wait for it before reaping the child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::handshake::{Handshake, HandshakeError, PluginAddr};
use crate::plugin::PluginSet;
use crate::session::{ByteSink, ClientSession, SessionError, SharedByteSink};

/// How long `start` waits for the handshake line by default.
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `kill` waits for a graceful exit before forcing one.
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);

/// Line buffer for the child's stderr; longer lines are forwarded as
/// fragments.
const STDERR_BUFFER: usize = 64 * 1024;

/// Everything needed to launch and supervise one plugin process.
pub struct ClientConfig {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    stdin: Option<Stdio>,
    plugins: PluginSet,
    start_timeout: Duration,
    stderr: ByteSink,
    sync_stdout: ByteSink,
    sync_stderr: ByteSink,
}

impl ClientConfig {
    /// Create a new builder for `ClientConfig`.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    stdin: Option<Stdio>,
    plugins: PluginSet,
    start_timeout: Duration,
    stderr: Option<ByteSink>,
    sync_stdout: Option<ByteSink>,
    sync_stderr: Option<ByteSink>,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stdin: None,
            plugins: PluginSet::new(),
            start_timeout: DEFAULT_START_TIMEOUT,
            stderr: None,
            sync_stdout: None,
            sync_stderr: None,
        }
    }
}

impl ClientConfigBuilder {
    /// Set the plugin executable to launch.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set command arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the child's working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Override the child's stdin; the default passes the supervisor's own
    /// stdin through.
    #[must_use]
    pub fn stdin(mut self, stdin: impl Into<Stdio>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Set the plugin set this client may dispense from.
    #[must_use]
    pub fn plugins(mut self, plugins: PluginSet) -> Self {
        self.plugins = plugins;
        self
    }

    /// Set the handshake timeout (default one minute).
    #[must_use]
    pub const fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Set the sink receiving the child's raw stderr lines.
    #[must_use]
    pub fn stderr<W>(mut self, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(sink));
        self
    }

    /// Set the sink receiving the plugin's forwarded stdout stream.
    #[must_use]
    pub fn sync_stdout<W>(mut self, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.sync_stdout = Some(Box::new(sink));
        self
    }

    /// Set the sink receiving the plugin's forwarded stderr stream.
    #[must_use]
    pub fn sync_stderr<W>(mut self, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.sync_stderr = Some(Box::new(sink));
        self
    }

    /// Build the `ClientConfig`.
    ///
    /// # Panics
    ///
    /// Panics if `command` is not set.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        ClientConfig {
            command: self.command.expect("command is required"),
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            stdin: self.stdin,
            plugins: self.plugins,
            start_timeout: self.start_timeout,
            stderr: self.stderr.unwrap_or_else(|| Box::new(tokio::io::sink())),
            sync_stdout: self
                .sync_stdout
                .unwrap_or_else(|| Box::new(tokio::io::sink())),
            sync_stderr: self
                .sync_stderr
                .unwrap_or_else(|| Box::new(tokio::io::sink())),
        }
    }
}

/// Launch parameters consumed by the first `start`.
struct LaunchSpec {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    stdin: Option<Stdio>,
}

#[derive(Default)]
struct SupervisorState {
    addr: Option<PluginAddr>,
    pid: Option<i32>,
    exited: bool,
    proc_killed: bool,
    exit_status: Option<ExitStatus>,
}

/// Supervisor for one plugin subprocess.
pub struct PluginClient {
    plugins: PluginSet,
    start_timeout: Duration,
    launch: Mutex<Option<LaunchSpec>>,
    stderr_sink: SharedByteSink,
    sync_stdout: SharedByteSink,
    sync_stderr: SharedByteSink,
    state: Arc<Mutex<SupervisorState>>,
    proto: tokio::sync::Mutex<Option<Arc<ClientSession>>>,
    start_lock: tokio::sync::Mutex<()>,
    done: CancellationToken,
    tasks: TaskTracker,
    stderr_tasks: TaskTracker,
}

impl PluginClient {
    /// Create a supervisor from `config`. Nothing runs until
    /// [`PluginClient::start`].
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            plugins: config.plugins,
            start_timeout: config.start_timeout,
            launch: Mutex::new(Some(LaunchSpec {
                command: config.command,
                args: config.args,
                env: config.env,
                cwd: config.cwd,
                stdin: config.stdin,
            })),
            stderr_sink: Arc::new(tokio::sync::Mutex::new(config.stderr)),
            sync_stdout: Arc::new(tokio::sync::Mutex::new(config.sync_stdout)),
            sync_stderr: Arc::new(tokio::sync::Mutex::new(config.sync_stderr)),
            state: Arc::new(Mutex::new(SupervisorState::default())),
            proto: tokio::sync::Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stderr_tasks: TaskTracker::new(),
        }
    }

    /// Launch the plugin and wait for its handshake line.
    ///
    /// Idempotent: once a handshake has been parsed, later calls return the
    /// cached address without spawning anything. If the child is running
    /// and `start` is about to fail, the child is killed before the error
    /// propagates.
    ///
    /// # Errors
    ///
    /// Spawn failures, the start timeout, an early child exit, or a
    /// malformed handshake line.
    pub async fn start(&self) -> Result<PluginAddr, ClientError> {
        let _guard = self.start_lock.lock().await;

        if let Some(addr) = self.state.lock().expect("lock poisoned").addr.clone() {
            return Ok(addr);
        }
        let Some(spec) = self.launch.lock().expect("lock poisoned").take() else {
            return Err(ClientError::AlreadyStarted);
        };

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(spec.stdin.unwrap_or_else(Stdio::inherit))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        info!(command = %spec.command, "starting plugin");
        let mut child = command.spawn().map_err(ClientError::Spawn)?;
        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(ClientError::Spawn(std::io::Error::other(
                "spawned plugin has no pid",
            )));
        };
        #[allow(clippy::cast_possible_wrap)]
        let pid = pid as i32;
        self.state.lock().expect("lock poisoned").pid = Some(pid);
        info!(pid, "plugin started");

        let Some(stdout_pipe) = child.stdout.take() else {
            self.kill_now();
            return Err(ClientError::Spawn(std::io::Error::other(
                "plugin stdout was not captured",
            )));
        };
        let Some(stderr_pipe) = child.stderr.take() else {
            self.kill_now();
            return Err(ClientError::Spawn(std::io::Error::other(
                "plugin stderr was not captured",
            )));
        };

        // Stderr forwarder, tracked by both wait groups: kill joins it with
        // everything else, the reaper waits for it specifically.
        self.tasks.spawn(
            self.stderr_tasks
                .track_future(log_stderr(stderr_pipe, Arc::clone(&self.stderr_sink))),
        );
        self.stderr_tasks.close();

        // Reaper: wait out the stderr forwarder, then the child, then flag
        // the exit and fire the session-scoped cancellation signal.
        {
            let stderr_tasks = self.stderr_tasks.clone();
            let state = Arc::clone(&self.state);
            let done = self.done.clone();
            self.tasks.spawn(async move {
                stderr_tasks.wait().await;
                let status = child.wait().await;
                match &status {
                    Ok(status) => info!(%status, "plugin process exited"),
                    Err(e) => warn!(error = %e, "waiting on plugin process failed"),
                }
                {
                    let mut state = state.lock().expect("lock poisoned");
                    state.exited = true;
                    state.exit_status = status.ok();
                }
                done.cancel();
            });
        }

        // Stdout line reader feeding a single-slot channel. The receiver is
        // dropped right after the handshake, so any later send fails and
        // ends the task.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(1);
        self.tasks.spawn(async move {
            let mut lines = BufReader::new(stdout_pipe).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    },
                    Ok(None) | Err(_) => break,
                }
            }
        });

        debug!("waiting for plugin handshake");
        let line = tokio::select! {
            // A handshake that is already waiting always wins over the
            // exit signal racing in behind it.
            biased;
            line = line_rx.recv() => match line {
                Some(line) => line,
                // Stdout closed without a handshake: either the child is
                // exiting (the reaper will tell us) or it is hanging with
                // its stdout shut, which the timeout covers.
                None => {
                    tokio::select! {
                        () = self.done.cancelled() => {
                            self.kill_now();
                            return Err(ClientError::EarlyExit);
                        },
                        () = tokio::time::sleep(self.start_timeout) => {
                            self.kill_now();
                            return Err(ClientError::StartTimeout);
                        },
                    }
                },
            },
            () = self.done.cancelled() => {
                self.kill_now();
                return Err(ClientError::EarlyExit);
            },
            () = tokio::time::sleep(self.start_timeout) => {
                self.kill_now();
                return Err(ClientError::StartTimeout);
            },
        };
        drop(line_rx);

        let handshake = match Handshake::parse_line(&line) {
            Ok(handshake) => handshake,
            Err(e) => {
                self.kill_now();
                return Err(e.into());
            },
        };

        let addr = handshake.addr;
        self.state.lock().expect("lock poisoned").addr = Some(addr.clone());
        Ok(addr)
    }

    /// Get the session for this plugin, starting and dialing as needed.
    ///
    /// Idempotent: the session is constructed once and cached. On a
    /// construction failure nothing is cached and the error propagates.
    ///
    /// # Errors
    ///
    /// Start failures and session-construction failures.
    pub async fn protocol(&self) -> Result<Arc<ClientSession>, ClientError> {
        let addr = self.start().await?;

        let mut proto = self.proto.lock().await;
        if let Some(proto) = proto.as_ref() {
            return Ok(Arc::clone(proto));
        }

        let session = ClientSession::connect(
            &addr,
            self.plugins.clone(),
            Arc::clone(&self.sync_stdout),
            Arc::clone(&self.sync_stderr),
        )
        .await?;
        let session = Arc::new(session);
        *proto = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Terminate the plugin, gracefully if possible, and join every
    /// supervisor task.
    ///
    /// When the plugin has an address, a `Quit` is sent through the session
    /// and the child is given two seconds to exit on its own; otherwise,
    /// or when the grace window lapses, the child is killed outright. Safe
    /// to call repeatedly: once the process handle is cleared, later calls
    /// return immediately. Never returns an error; internal failures are
    /// logged.
    pub async fn kill(&self) {
        let (pid, addr) = {
            let state = self.state.lock().expect("lock poisoned");
            (state.pid, state.addr.clone())
        };
        let Some(pid) = pid else {
            return;
        };

        let mut graceful = false;
        if addr.is_some() {
            match self.protocol().await {
                Ok(proto) => match proto.close().await {
                    Ok(()) => graceful = true,
                    Err(e) => warn!(error = %e, "error closing session during kill"),
                },
                Err(e) => warn!(error = %e, "session unavailable during kill"),
            }
        }

        if graceful
            && tokio::time::timeout(GRACEFUL_WAIT, self.done.cancelled())
                .await
                .is_ok()
        {
            debug!("plugin exited gracefully");
            self.finish().await;
            return;
        }

        warn!("plugin failed to exit gracefully");
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        self.state.lock().expect("lock poisoned").proc_killed = true;
        self.finish().await;
    }

    /// Whether the subprocess has been observed to exit.
    #[must_use]
    pub fn exited(&self) -> bool {
        self.state.lock().expect("lock poisoned").exited
    }

    /// Whether the subprocess had to be forcibly killed.
    ///
    /// Observational only; a well-behaved plugin that honors `Quit` leaves
    /// this false.
    #[must_use]
    pub fn killed(&self) -> bool {
        self.state.lock().expect("lock poisoned").proc_killed
    }

    /// The child's exit status, once it has been reaped.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state.lock().expect("lock poisoned").exit_status
    }

    /// Post-spawn guard: kill the child before an error propagates.
    fn kill_now(&self) {
        let pid = self.state.lock().expect("lock poisoned").pid;
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    /// Join all supervisor tasks, then clear the process handle.
    async fn finish(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.state.lock().expect("lock poisoned").pid = None;
    }
}

enum StderrPiece {
    /// A complete line (newline stripped).
    Line,
    /// A full buffer with no newline yet; more of the line follows.
    Fragment,
    Eof,
}

/// Read the next line, or a 64 KiB fragment of an oversized line, from the
/// child's stderr.
async fn next_stderr_piece<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<StderrPiece>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() {
                StderrPiece::Eof
            } else {
                // Unterminated trailing output still gets forwarded.
                StderrPiece::Line
            });
        }

        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            let take = pos.min(STDERR_BUFFER - buf.len());
            buf.extend_from_slice(&available[..take]);
            reader.consume(take);
            if take == pos {
                reader.consume(1);
                return Ok(StderrPiece::Line);
            }
            return Ok(StderrPiece::Fragment);
        }

        let take = available.len().min(STDERR_BUFFER - buf.len());
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);
        if buf.len() == STDERR_BUFFER {
            return Ok(StderrPiece::Fragment);
        }
    }
}

/// Forward the child's stderr to the host sink, line by line.
///
/// Fragments of oversized lines are forwarded byte-for-byte as they fill
/// the buffer; the synthetic newline is appended only on the piece that
/// completes a line. Each piece is also logged through the host's logger.
async fn log_stderr(stderr: ChildStderr, sink: SharedByteSink) {
    let mut reader = BufReader::with_capacity(STDERR_BUFFER, stderr);
    let mut line: Vec<u8> = Vec::new();

    loop {
        line.clear();
        match next_stderr_piece(&mut reader, &mut line).await {
            Err(e) => {
                debug!(error = %e, "reading plugin stderr failed");
                return;
            },
            Ok(StderrPiece::Eof) => return,
            Ok(piece) => {
                let complete = matches!(piece, StderrPiece::Line);
                {
                    let mut sink = sink.lock().await;
                    let _ = sink.write_all(&line).await;
                    if complete {
                        let _ = sink.write_all(b"\n").await;
                    }
                    let _ = sink.flush().await;
                }
                debug!(line = %String::from_utf8_lossy(&line), "plugin stderr");
            },
        }
    }
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The plugin executable could not be spawned.
    #[error("failed to spawn plugin: {0}")]
    Spawn(#[source] std::io::Error),

    /// A previous `start` already consumed the launch parameters.
    #[error("plugin already started")]
    AlreadyStarted,

    /// No handshake line arrived within the start timeout.
    #[error("timeout while waiting for plugin to start")]
    StartTimeout,

    /// The subprocess exited before announcing an address.
    #[error("plugin exited before we could connect")]
    EarlyExit,

    /// The handshake line did not parse.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Session construction or teardown failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    /// An observable in-memory sink.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().expect("lock poisoned").clone()
        }
    }

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.0.lock().expect("lock poisoned").extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn shell_client(script: &str) -> PluginClient {
        PluginClient::new(
            ClientConfig::builder()
                .command("sh")
                .args(["-c", script])
                .build(),
        )
    }

    #[tokio::test]
    async fn test_start_parses_mock_address() {
        let client = shell_client("echo 'tcp|:1234'; sleep 30");

        let addr = client.start().await.unwrap();
        assert_eq!(addr.network(), "tcp");
        assert_eq!(addr.to_string(), ":1234");

        client.kill().await;
        assert!(client.exited());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let client = shell_client("echo 'tcp|:4321'; sleep 30");

        let first = client.start().await.unwrap();
        let second = client.start().await.unwrap();
        assert_eq!(first, second);

        client.kill().await;
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let client = PluginClient::new(
            ClientConfig::builder()
                .command("sh")
                .args(["-c", "sleep 30"])
                .start_timeout(Duration::from_millis(50))
                .build(),
        );

        let err = client.start().await.unwrap_err();
        assert_eq!(err.to_string(), "timeout while waiting for plugin to start");

        client.kill().await;
    }

    #[tokio::test]
    async fn test_unparseable_handshake_fails_start() {
        let client = shell_client("echo 'such nonsense'; sleep 30");

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, ClientError::Handshake(_)));

        client.kill().await;
        assert!(client.exited());
    }

    #[tokio::test]
    async fn test_early_exit_fails_start() {
        let client = shell_client("exit 0");

        let err = client.start().await.unwrap_err();
        assert_eq!(err.to_string(), "plugin exited before we could connect");

        client.kill().await;
        assert!(client.exited());
        assert!(client.exit_status().is_some_and(|s| s.success()));
    }

    #[tokio::test]
    async fn test_stderr_forwarded_to_sink() {
        let stderr = SharedBuf::default();
        let client = PluginClient::new(
            ClientConfig::builder()
                .command("sh")
                .args(["-c", "echo 'tcp|:1'; echo HELLO >&2; echo WORLD >&2"])
                .stderr(stderr.clone())
                .build(),
        );

        client.start().await.unwrap();
        while !client.exited() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let logged = String::from_utf8(stderr.contents()).unwrap();
        assert!(logged.contains("HELLO\n"), "bad stderr: {logged:?}");
        assert!(logged.contains("WORLD\n"), "bad stderr: {logged:?}");

        client.kill().await;
    }

    #[tokio::test]
    async fn test_kill_before_start_is_a_noop() {
        let client = shell_client("echo 'tcp|:1'; sleep 30");
        client.kill().await;
        assert!(!client.exited());
        assert!(!client.killed());
    }

    #[tokio::test]
    async fn test_forced_kill_sets_flag() {
        let client = shell_client("echo 'tcp|:59999'; sleep 30");

        client.start().await.unwrap();
        client.kill().await;

        assert!(client.exited());
        assert!(client.killed(), "no server listens, so kill must force");
    }
}
