//! Byte-stream RPC: register services by name, call methods by name.
//!
//! Messages are length-prefixed JSON over any mux stream:
//!
//! ```text
//! +--------------------+---------------------------------------------+
//! | Length (4 B, BE)   | {"id", "service", "method", "params"}       |
//! +--------------------+---------------------------------------------+
//! ```
//!
//! Responses carry either a `result` value or an `error` string. Error type
//! identity does not survive the process boundary: a failing handler crosses
//! back as nothing but its message.
//!
//! The [`RpcServer`] handles one request at a time per stream, so a caller
//! that has observed a reply knows the server executed the call. The
//! [`RpcEndpoint`] may be cloned and called concurrently; responses are
//! routed back by id.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mux::MuxStream;

/// Upper bound on one RPC message body.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// One RPC call on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Caller-chosen correlation id, echoed in the response.
    pub id: u64,
    /// Registered service name, e.g. `Control`.
    pub service: String,
    /// Method name within the service.
    pub method: String,
    /// Method parameters; `null` when the method takes none.
    #[serde(default)]
    pub params: Value,
}

/// The reply to a [`Request`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request being answered.
    pub id: u64,
    /// Successful result, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Stringified failure, if the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A named bundle of callable methods served over a stream.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Execute `method` with `params`, returning the result value.
    async fn call(&self, method: &str, params: Value) -> Result<Value, ServiceError>;
}

/// Read one length-prefixed message; `None` on clean EOF at a boundary.
async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {},
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RpcError::MessageTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed message and flush it.
async fn write_message<W>(writer: &mut W, body: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(RpcError::MessageTooLarge(body.len()));
    }

    #[allow(clippy::cast_possible_truncation)] // Validated above.
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

struct EndpointShared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<MuxStream>>>,
    closed: CancellationToken,
}

/// Caller side of an RPC stream.
///
/// Cheap to clone; all clones share the stream. Calls may be issued
/// concurrently and are answered by correlation id. Once the stream is
/// severed, by [`RpcEndpoint::close`] or by the peer, every in-flight and
/// future call fails with [`RpcError::Closed`].
#[derive(Clone)]
pub struct RpcEndpoint {
    shared: Arc<EndpointShared>,
}

impl RpcEndpoint {
    /// Build an endpoint over `stream`, spawning its response reader.
    #[must_use]
    pub fn new(stream: MuxStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        let shared = Arc::new(EndpointShared {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(Some(write)),
            closed: CancellationToken::new(),
        });
        tokio::spawn(run_response_reader(read, Arc::clone(&shared)));
        Self { shared }
    }

    /// Invoke `service.method` and wait for its reply.
    ///
    /// # Errors
    ///
    /// [`RpcError::Remote`] carries the peer's stringified failure;
    /// [`RpcError::Closed`] means the stream is gone.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        if self.shared.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("lock poisoned")
            .insert(id, tx);

        let body = serde_json::to_vec(&Request {
            id,
            service: service.to_string(),
            method: method.to_string(),
            params,
        })?;

        let write_result = {
            let mut writer = self.shared.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => write_message(writer, &body).await,
                None => Err(RpcError::Closed),
            }
        };
        if let Err(e) = write_result {
            self.shared
                .pending
                .lock()
                .expect("lock poisoned")
                .remove(&id);
            return Err(e);
        }

        let response = tokio::select! {
            () = self.shared.closed.cancelled() => {
                self.shared.pending.lock().expect("lock poisoned").remove(&id);
                return Err(RpcError::Closed);
            },
            response = rx => response.map_err(|_| RpcError::Closed)?,
        };

        match response.error {
            Some(message) => Err(RpcError::Remote(message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Shut down the write half and fail all in-flight calls.
    ///
    /// # Errors
    ///
    /// Returns the shutdown I/O error, if any; the endpoint is closed either
    /// way.
    pub async fn close(&self) -> Result<(), RpcError> {
        self.shared.closed.cancel();
        let writer = self.shared.writer.lock().await.take();
        self.shared.pending.lock().expect("lock poisoned").clear();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Whether the endpoint has been severed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

async fn run_response_reader(mut read: ReadHalf<MuxStream>, shared: Arc<EndpointShared>) {
    loop {
        match read_message(&mut read).await {
            Ok(Some(body)) => match serde_json::from_slice::<Response>(&body) {
                Ok(response) => {
                    let waiter = shared
                        .pending
                        .lock()
                        .expect("lock poisoned")
                        .remove(&response.id);
                    if let Some(tx) = waiter {
                        let _ = tx.send(response);
                    }
                },
                Err(e) => {
                    debug!(error = %e, "undecodable rpc response; severing endpoint");
                    break;
                },
            },
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "rpc endpoint read failed");
                break;
            },
        }
    }
    shared.closed.cancel();
    shared.pending.lock().expect("lock poisoned").clear();
}

/// Server side of an RPC stream: a registry of named services.
#[derive(Default)]
pub struct RpcServer {
    services: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl RpcServer {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding a single service.
    #[must_use]
    pub fn with_service(name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        let mut server = Self::new();
        server.register(name, handler);
        server
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        self.services.insert(name.into(), handler);
    }

    /// Serve requests on `stream` until it closes.
    ///
    /// Requests are handled strictly in order. A failing handler produces an
    /// error response; only transport-level problems end the loop.
    ///
    /// # Errors
    ///
    /// Returns the transport or codec error that ended the loop; a clean
    /// peer close returns `Ok`.
    pub async fn serve(self, stream: MuxStream) -> Result<(), RpcError> {
        let (mut read, mut write) = tokio::io::split(stream);

        loop {
            let Some(body) = read_message(&mut read).await? else {
                return Ok(());
            };

            // A request we cannot decode has no id to answer with.
            let request: Request = serde_json::from_slice(&body)?;
            let response = match self.dispatch(&request).await {
                Ok(result) => Response {
                    id: request.id,
                    result: Some(result),
                    error: None,
                },
                Err(e) => Response {
                    id: request.id,
                    result: None,
                    error: Some(e.to_string()),
                },
            };

            let body = serde_json::to_vec(&response)?;
            write_message(&mut write, &body).await?;
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<Value, ServiceError> {
        let handler = self
            .services
            .get(&request.service)
            .ok_or_else(|| ServiceError::Failed(format!("unknown service: {}", request.service)))?;
        handler.call(&request.method, request.params.clone()).await
    }
}

/// Failure produced by a service handler.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service has no such method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The parameters did not decode as the method expects.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The handler failed; only the message crosses the wire.
    #[error("{0}")]
    Failed(String),
}

/// RPC transport errors.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The stream is severed; no further calls can complete.
    #[error("rpc endpoint closed")]
    Closed,

    /// Stream I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A message exceeded the size bound.
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),

    /// The peer reported a failure; only its message survives.
    #[error("{0}")]
    Remote(String),
}
