//! Plugin-side runtime: listen, announce, serve host sessions.
//!
//! [`serve`] is the body of a plugin executable. It binds a unix-domain
//! listener at a fresh temporary path, announces it on stdout as the
//! handshake line, redirects the process's stdout and stderr into capture
//! pipes (so everything the plugin prints after the handshake reaches the
//! host over the session's stdio streams), and then accepts host
//! connections until a `Quit` arrives on some control stream.
//!
//! Per connection the runtime accepts the three fixed streams in the order
//! the host opens them: control, then forwarded stdout, then forwarded stderr,
//! then serves the built-in `Control` and `Dispenser` services on the
//! control stream.

use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use serde_json::{Value, json};
use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::broker::StreamBroker;
use crate::handshake::{
    CORE_PROTOCOL_VERSION, DEFAULT_APP_PROTOCOL_VERSION, Handshake, PluginAddr,
};
use crate::mux::{Mode, MuxSession, MuxStream};
use crate::plugin::{PLUGIN_SERVICE, PluginSet};
use crate::rpc::{RpcServer, ServiceError, ServiceHandler};

/// Capture-pipe read end shared between connections.
type SharedPipe = Arc<tokio::sync::Mutex<pipe::Receiver>>;

/// Grace period for in-flight connections after the quit signal.
const CONNECTION_DRAIN: std::time::Duration = std::time::Duration::from_secs(1);

/// What a plugin process serves.
pub struct ServeConfig {
    /// The services this plugin exposes. Must match the host's set.
    pub plugins: PluginSet,
    /// Application protocol version announced in the handshake line.
    pub app_protocol: u32,
}

impl ServeConfig {
    /// Config serving `plugins` with the default app protocol version.
    #[must_use]
    pub fn new(plugins: PluginSet) -> Self {
        Self {
            plugins,
            app_protocol: DEFAULT_APP_PROTOCOL_VERSION,
        }
    }
}

/// Run the plugin side of the protocol until the host asks us to quit.
///
/// Prints the handshake line as the first stdout output, then captures the
/// process's stdio. A fatal failure preparing the capture pipes exits the
/// process with a nonzero code; a clean `Quit` returns `Ok` and lets the
/// caller fall off its main function.
///
/// # Errors
///
/// Listener creation or accept failures.
pub async fn serve(config: ServeConfig) -> Result<(), ServeError> {
    let (listener, path) = bind_listener()?;

    // Prepare the capture pipes before announcing anything. The contract
    // for a broken pipe setup is a nonzero process exit, not an error the
    // plugin author has to route.
    let (stdout_capture, stderr_capture) = match (StdioCapture::new(), StdioCapture::new()) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Error preparing plugin: {e}");
            std::process::exit(1);
        },
    };

    info!(address = %path.display(), "plugin listening");

    let handshake = Handshake {
        core_protocol: CORE_PROTOCOL_VERSION,
        app_protocol: config.app_protocol,
        addr: PluginAddr::Unix(path.clone()),
    };
    {
        let mut stdout = std::io::stdout();
        if writeln!(stdout, "{}", handshake.to_line())
            .and_then(|()| stdout.flush())
            .is_err()
        {
            eprintln!("Error preparing plugin: handshake write failed");
            std::process::exit(1);
        }
    }

    // From here on the process's own stdout/stderr feed the capture pipes
    // and reach the host over the session's stdio streams.
    if let Err(e) = stdout_capture
        .redirect(1)
        .and_then(|()| stderr_capture.redirect(2))
    {
        eprintln!("Error preparing plugin: {e}");
        std::process::exit(1);
    }

    let stdout_pipe: SharedPipe = Arc::new(tokio::sync::Mutex::new(stdout_capture.reader));
    let stderr_pipe: SharedPipe = Arc::new(tokio::sync::Mutex::new(stderr_capture.reader));
    let done = CancellationToken::new();
    let connections = TaskTracker::new();

    let result = loop {
        tokio::select! {
            () = done.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((conn, _addr)) => {
                    connections.spawn(handle_connection(
                        conn,
                        config.plugins.clone(),
                        Arc::clone(&stdout_pipe),
                        Arc::clone(&stderr_pipe),
                        done.clone(),
                    ));
                },
                Err(e) => {
                    error!(error = %e, "listener accept failed");
                    break Err(ServeError::Accept(e));
                },
            },
        }
    };

    // Let in-flight control streams wind down so the peer that sent Quit
    // sees its reply before the process goes away.
    connections.close();
    let _ = tokio::time::timeout(CONNECTION_DRAIN, connections.wait()).await;

    drop(listener);
    let _ = std::fs::remove_file(&path);
    result
}

/// Create the unix-domain listener at a fresh temporary path.
///
/// The path is claimed with a temp file, the file removed, and the socket
/// bound in its place; the caller unlinks the socket again after the
/// listener closes.
fn bind_listener() -> Result<(UnixListener, PathBuf), ServeError> {
    let file = tempfile::Builder::new()
        .prefix("plugin")
        .tempfile()
        .map_err(ServeError::Listen)?;
    let path = file.path().to_path_buf();
    // The socket path must not exist at bind time.
    drop(file);

    let listener = UnixListener::bind(&path).map_err(ServeError::Listen)?;
    Ok((listener, path))
}

/// One capture pipe: the write end replaces a standard fd, the read end is
/// drained into the session's stdio streams.
struct StdioCapture {
    reader: pipe::Receiver,
    writer: OwnedFd,
}

impl StdioCapture {
    fn new() -> std::io::Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(nix_to_io)?;
        let read_fd = unsafe { OwnedFd::from_raw_fd(read_fd) };
        let write_fd = unsafe { OwnedFd::from_raw_fd(write_fd) };

        // Tokio's pipe receiver requires a non-blocking fd.
        let flags = fcntl(read_fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(nix_to_io)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(read_fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(nix_to_io)?;

        Ok(Self {
            reader: pipe::Receiver::from_owned_fd(read_fd)?,
            writer: write_fd,
        })
    }

    /// Point `target` (1 for stdout, 2 for stderr) at the pipe's write end.
    fn redirect(&self, target: RawFd) -> std::io::Result<()> {
        nix::unistd::dup2(self.writer.as_raw_fd(), target).map_err(nix_to_io)?;
        Ok(())
    }
}

fn nix_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

/// Serve one host connection: fixed streams, broker, control RPC.
async fn handle_connection(
    conn: UnixStream,
    plugins: PluginSet,
    stdout_pipe: SharedPipe,
    stderr_pipe: SharedPipe,
    done: CancellationToken,
) {
    let mux = Arc::new(MuxSession::new(conn, Mode::Server));

    let control = match mux.accept_stream().await {
        Ok(stream) => stream,
        Err(_) => {
            // Peer hung up before the session got going.
            debug!("connection closed before control stream");
            mux.close();
            return;
        },
    };

    let stdout_stream = match mux.accept_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "accepting stdout stream");
            mux.close();
            return;
        },
    };
    let stderr_stream = match mux.accept_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "accepting stderr stream");
            mux.close();
            return;
        },
    };

    tokio::spawn(copy_capture(stdout_pipe, stdout_stream, "stdout"));
    tokio::spawn(copy_capture(stderr_pipe, stderr_stream, "stderr"));

    let broker = Arc::new(StreamBroker::new(Arc::clone(&mux)));
    tokio::spawn(Arc::clone(&broker).run());

    let mut rpc = RpcServer::new();
    rpc.register("Control", Arc::new(ControlService { done }));
    rpc.register("Dispenser", Arc::new(DispenserService { plugins, broker }));
    if let Err(e) = rpc.serve(control).await {
        debug!(error = %e, "control stream ended");
    }
}

/// Drain a capture pipe into its session stream.
///
/// Holds the pipe for the lifetime of the connection; a second concurrent
/// session would wait here, which matches the one-session-per-process model.
async fn copy_capture(pipe: SharedPipe, mut stream: MuxStream, label: &'static str) {
    let mut reader = pipe.lock().await;
    if let Err(e) = tokio::io::copy(&mut *reader, &mut stream).await {
        debug!(stream = label, error = %e, "stdio capture forwarding ended");
    }
}

/// Built-in liveness/teardown service.
struct ControlService {
    done: CancellationToken,
}

#[async_trait]
impl ServiceHandler for ControlService {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, ServiceError> {
        match method {
            "Ping" => Ok(Value::Null),
            "Quit" => {
                self.done.cancel();
                Ok(Value::Null)
            },
            other => Err(ServiceError::UnknownMethod(other.to_string())),
        }
    }
}

/// Built-in service that opens named application services.
struct DispenserService {
    plugins: PluginSet,
    broker: Arc<StreamBroker>,
}

#[async_trait]
impl ServiceHandler for DispenserService {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        if method != "Dispense" {
            return Err(ServiceError::UnknownMethod(method.to_string()));
        }

        let name: String =
            serde_json::from_value(params).map_err(|e| ServiceError::InvalidParams(e.to_string()))?;
        let plugin = self
            .plugins
            .get(&name)
            .ok_or_else(|| ServiceError::Failed(format!("unknown plugin type: {name}")))?;

        // Construct first so a failing constructor reaches the caller.
        let handler = plugin
            .server(&self.broker)
            .map_err(|e| ServiceError::Failed(e.to_string()))?;

        // The caller gets the id right away; the rendezvous can only happen
        // after this reply is on the wire.
        let id = self.broker.next_id();
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            let stream = match broker.accept(id).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(plugin = %name, error = %e, "plugin dispense failed");
                    return;
                },
            };
            if let Err(e) = RpcServer::with_service(PLUGIN_SERVICE, handler)
                .serve(stream)
                .await
            {
                error!(plugin = %name, error = %e, "dispensed service ended with error");
            }
        });

        Ok(json!(id))
    }
}

/// Server runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The unix-domain listener could not be created.
    #[error("failed to create listener: {0}")]
    Listen(#[source] std::io::Error),

    /// The accept loop failed.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
}
