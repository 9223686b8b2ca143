//! Host-side session runtime over a dialed plugin connection.
//!
//! Construction layers a client-role mux over the connection and opens the
//! session's three fixed streams in order: control RPC first, then the
//! forwarded-stdout and forwarded-stderr streams. The plugin accepts them in
//! the same order; opening them out of order breaks the session. After the
//! fixed streams, a broker takes over stream creation for dispensed
//! services.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::broker::{BrokerError, StreamBroker};
use crate::handshake::PluginAddr;
use crate::mux::{Mode, MuxError, MuxSession, MuxStream};
use crate::plugin::{PluginError, PluginSet};
use crate::rpc::{RpcEndpoint, RpcError};

/// A writer receiving one of the plugin's forwarded stdio streams.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// A sink shared with the forwarding task.
pub type SharedByteSink = Arc<tokio::sync::Mutex<ByteSink>>;

struct StdioWriters {
    stdout: WriteHalf<MuxStream>,
    stderr: WriteHalf<MuxStream>,
}

/// One live host↔plugin session.
///
/// Owns the control RPC channel, the stdio forwarders, and the broker for
/// dispensed streams. Dropping the session without [`ClientSession::close`]
/// abandons the connection; the supervisor's kill path will still reap the
/// process.
pub struct ClientSession {
    plugins: PluginSet,
    broker: Arc<StreamBroker>,
    control: RpcEndpoint,
    stdio: Mutex<Option<StdioWriters>>,
    closed: AtomicBool,
}

impl ClientSession {
    /// Dial `addr` and build a session over the resulting connection.
    ///
    /// A TCP address with an empty host dials loopback.
    ///
    /// # Errors
    ///
    /// Dial and session-construction failures; nothing is cached on failure.
    pub async fn connect(
        addr: &PluginAddr,
        plugins: PluginSet,
        stdout_sink: SharedByteSink,
        stderr_sink: SharedByteSink,
    ) -> Result<Self, SessionError> {
        match addr {
            PluginAddr::Tcp(addr) => {
                let target = if addr.starts_with(':') {
                    format!("127.0.0.1{addr}")
                } else {
                    addr.clone()
                };
                let conn = TcpStream::connect(&target)
                    .await
                    .map_err(SessionError::Dial)?;
                Self::from_connection(conn, plugins, stdout_sink, stderr_sink).await
            },
            PluginAddr::Unix(path) => {
                let conn = UnixStream::connect(path)
                    .await
                    .map_err(SessionError::Dial)?;
                Self::from_connection(conn, plugins, stdout_sink, stderr_sink).await
            },
        }
    }

    /// Build a session over an already-established connection.
    ///
    /// # Errors
    ///
    /// If any of the three fixed streams cannot be opened the mux is closed
    /// and the failure returned.
    pub async fn from_connection<T>(
        io: T,
        plugins: PluginSet,
        stdout_sink: SharedByteSink,
        stderr_sink: SharedByteSink,
    ) -> Result<Self, SessionError>
    where
        T: tokio::io::AsyncRead + AsyncWrite + Send + 'static,
    {
        let mux = Arc::new(MuxSession::new(io, Mode::Client));

        // The fixed streams must go out in this exact order; the plugin
        // accepts them positionally.
        let control = open_or_close(&mux).await?;
        let stdout = open_or_close(&mux).await?;
        let stderr = open_or_close(&mux).await?;

        let control = RpcEndpoint::new(control);
        let broker = Arc::new(StreamBroker::new(Arc::clone(&mux)));
        tokio::spawn(Arc::clone(&broker).run());

        let (stdout_rd, stdout_wr) = tokio::io::split(stdout);
        let (stderr_rd, stderr_wr) = tokio::io::split(stderr);
        tokio::spawn(forward_stdio(stdout_rd, stdout_sink, "stdout"));
        tokio::spawn(forward_stdio(stderr_rd, stderr_sink, "stderr"));

        Ok(Self {
            plugins,
            broker,
            control,
            stdio: Mutex::new(Some(StdioWriters {
                stdout: stdout_wr,
                stderr: stderr_wr,
            })),
            closed: AtomicBool::new(false),
        })
    }

    /// Request a typed proxy for the named service.
    ///
    /// The name is checked against the local plugin set first, so a local
    /// mismatch fails without a round trip. On success the returned box
    /// downcasts to whatever proxy type this plugin's client constructor
    /// produces.
    ///
    /// # Errors
    ///
    /// `unknown plugin type` locally or remotely; broker and RPC failures
    /// leave the session usable.
    pub async fn dispense(&self, name: &str) -> Result<Box<dyn Any + Send>, SessionError> {
        let plugin = self
            .plugins
            .get(name)
            .ok_or_else(|| SessionError::UnknownPlugin(name.to_string()))?
            .clone();

        let value = self
            .control
            .call("Dispenser", "Dispense", Value::String(name.to_string()))
            .await?;
        let id: u32 = serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("bad dispense response: {e}")))?;

        let stream = self.broker.dial(id).await?;
        Ok(plugin.client(&self.broker, RpcEndpoint::new(stream))?)
    }

    /// Liveness check against the plugin's control service.
    ///
    /// # Errors
    ///
    /// Any control-channel failure, including a severed connection.
    pub async fn ping(&self) -> Result<(), SessionError> {
        self.control.call("Control", "Ping", Value::Null).await?;
        Ok(())
    }

    /// Ask the plugin to quit, then release every session resource.
    ///
    /// The `Quit` call's error is retained while the control channel, the
    /// two stdio streams, and the broker are closed in that order,
    /// best-effort; an early failure never skips a later close. Idempotent:
    /// a second call returns `Ok` without touching anything.
    ///
    /// # Errors
    ///
    /// The retained `Quit` error if there was one, otherwise the first close
    /// error.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let quit_err = self
            .control
            .call("Control", "Quit", Value::Null)
            .await
            .err();
        let mut close_err: Option<SessionError> = None;

        if let Err(e) = self.control.close().await {
            close_err.get_or_insert(e.into());
        }

        let stdio = self.stdio.lock().expect("lock poisoned").take();
        if let Some(mut stdio) = stdio {
            if let Err(e) = stdio.stdout.shutdown().await {
                close_err.get_or_insert(SessionError::Io(e));
            }
            if let Err(e) = stdio.stderr.shutdown().await {
                close_err.get_or_insert(SessionError::Io(e));
            }
        }

        self.broker.close();

        match quit_err {
            Some(e) => Err(e.into()),
            None => close_err.map_or(Ok(()), Err),
        }
    }
}

/// Open one fixed stream, tearing the mux down on failure.
async fn open_or_close(mux: &Arc<MuxSession>) -> Result<MuxStream, SessionError> {
    match mux.open_stream().await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            mux.close();
            Err(e.into())
        },
    }
}

/// Copy one forwarded stdio stream into the host-supplied sink.
async fn forward_stdio(
    mut stream: ReadHalf<MuxStream>,
    sink: SharedByteSink,
    label: &'static str,
) {
    let mut sink = sink.lock().await;
    if let Err(e) = tokio::io::copy(&mut stream, &mut *sink).await {
        debug!(stream = label, error = %e, "stdio forwarding ended");
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested service is not in the plugin set.
    #[error("unknown plugin type: {0}")]
    UnknownPlugin(String),

    /// The plugin's address could not be dialed.
    #[error("failed to dial plugin: {0}")]
    Dial(#[source] std::io::Error),

    /// The peer answered a dispense with something that is not a stream id.
    #[error("{0}")]
    Protocol(String),

    /// Mux failure while building the session.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// Control-channel RPC failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Broker rendezvous failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Plugin constructor failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Stream close failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::rpc::{RpcServer, ServiceError, ServiceHandler};

    struct FakeControl {
        quit: CancellationToken,
    }

    #[async_trait]
    impl ServiceHandler for FakeControl {
        async fn call(&self, method: &str, _params: Value) -> Result<Value, ServiceError> {
            match method {
                "Ping" => Ok(Value::Null),
                "Quit" => {
                    self.quit.cancel();
                    Ok(Value::Null)
                },
                other => Err(ServiceError::UnknownMethod(other.to_string())),
            }
        }
    }

    fn discard() -> SharedByteSink {
        Arc::new(tokio::sync::Mutex::new(
            Box::new(tokio::io::sink()) as ByteSink
        ))
    }

    /// Stand-in for the plugin side: accept the three fixed streams and
    /// serve a control service on the first.
    fn fake_plugin_peer<T>(io: T) -> CancellationToken
    where
        T: tokio::io::AsyncRead + AsyncWrite + Send + 'static,
    {
        let quit = CancellationToken::new();
        let observed = quit.clone();
        tokio::spawn(async move {
            let mux = MuxSession::new(io, Mode::Server);
            let control = mux.accept_stream().await.unwrap();
            let _stdout = mux.accept_stream().await.unwrap();
            let _stderr = mux.accept_stream().await.unwrap();
            let _ = RpcServer::with_service("Control", Arc::new(FakeControl { quit: observed }))
                .serve(control)
                .await;
        });
        quit
    }

    #[tokio::test]
    async fn test_construct_and_ping() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let _quit = fake_plugin_peer(b);

        let session = ClientSession::from_connection(a, PluginSet::new(), discard(), discard())
            .await
            .unwrap();
        session.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispense_unknown_name_fails_locally() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let _quit = fake_plugin_peer(b);

        let session = ClientSession::from_connection(a, PluginSet::new(), discard(), discard())
            .await
            .unwrap();
        let err = session.dispense("nope").await.unwrap_err();
        assert_eq!(err.to_string(), "unknown plugin type: nope");
    }

    #[tokio::test]
    async fn test_close_quits_peer_and_is_idempotent() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let quit = fake_plugin_peer(b);

        let session = ClientSession::from_connection(a, PluginSet::new(), discard(), discard())
            .await
            .unwrap();
        session.close().await.unwrap();
        quit.cancelled().await;

        // Second close is a no-op, and the control channel is gone.
        session.close().await.unwrap();
        assert!(session.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_stdio_streams_reach_sinks() {
        let (a, b) = tokio::io::duplex(64 * 1024);

        // Peer writes into the forwarded-stdout stream directly.
        tokio::spawn(async move {
            let mux = MuxSession::new(b, Mode::Server);
            let _control = mux.accept_stream().await.unwrap();
            let mut stdout = mux.accept_stream().await.unwrap();
            let _stderr = mux.accept_stream().await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut stdout, b"from plugin")
                .await
                .unwrap();
            stdout.shutdown().await.unwrap();
            // Keep the session alive while the host drains the stream.
            std::future::pending::<()>().await;
        });

        let (sink_rx, sink_tx) = tokio::io::duplex(1024);
        let stdout_sink: SharedByteSink =
            Arc::new(tokio::sync::Mutex::new(Box::new(sink_tx) as ByteSink));

        let _session =
            ClientSession::from_connection(a, PluginSet::new(), stdout_sink, discard())
                .await
                .unwrap();

        let mut got = vec![0u8; 11];
        let mut sink_rx = sink_rx;
        sink_rx.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"from plugin");
    }
}
