//! Session multiplexer: many ordered byte streams over one connection.
//!
//! A [`MuxSession`] wraps a single bidirectional connection and carries any
//! number of independent logical streams over it. Each frame on the wire is
//! length-prefixed:
//!
//! ```text
//! +--------------------+-------------------+----------+----------+
//! | Length (4 B, BE)   | Stream id (4 B)   | Kind (1B)| Payload  |
//! +--------------------+-------------------+----------+----------+
//! ```
//!
//! Kinds are `SYN` (peer opened a stream), `DATA`, and `FIN` (peer finished
//! writing). Stream ids carry role parity (the client side allocates odd
//! ids, the server side even) so both peers can open streams without
//! coordination. All frames share one ordered writer, which is what
//! guarantees that streams opened in sequence are accepted by the peer in
//! the same sequence.
//!
//! Closing one stream never disturbs its siblings; closing the session tears
//! down every stream and the underlying connection.
//!
//! Inbound flow control is coarse: each stream buffers a bounded amount of
//! received data, and a stream whose consumer stops reading eventually
//! backpressures the session's inbound loop.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf,
    WriteHalf, duplex,
};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Frame header length: 4-byte big-endian payload length.
const HEADER_LEN: usize = 4;

/// Fixed frame body prefix: stream id (4) + kind (1).
const BODY_PREFIX_LEN: usize = 5;

/// Maximum frame size accepted on the wire.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Per-stream buffered bytes in each direction.
const STREAM_BUFFER: usize = 256 * 1024;

/// Outbound read chunk for a single DATA frame.
const DATA_CHUNK: usize = 16 * 1024;

/// Bounded queue depth of decoded-but-unconsumed chunks per stream.
const INBOUND_QUEUE: usize = 16;

/// Bounded queue depth of accepted-but-unclaimed streams.
const ACCEPT_QUEUE: usize = 16;

/// Which end of the connection this session is.
///
/// Roles fix the stream-id parity so both sides can open streams; they must
/// be agreed at construction time (the dialing side is the client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The dialing side; allocates odd stream ids.
    Client,
    /// The accepting side; allocates even stream ids.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Syn,
    Data,
    Fin,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Syn),
            1 => Some(Self::Data),
            2 => Some(Self::Fin),
            _ => None,
        }
    }

    const fn as_byte(self) -> u8 {
        match self {
            Self::Syn => 0,
            Self::Data => 1,
            Self::Fin => 2,
        }
    }
}

#[derive(Debug)]
struct Frame {
    id: u32,
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    const fn syn(id: u32) -> Self {
        Self {
            id,
            kind: FrameKind::Syn,
            payload: Bytes::new(),
        }
    }

    fn data(id: u32, payload: Bytes) -> Self {
        Self {
            id,
            kind: FrameKind::Data,
            payload,
        }
    }

    const fn fin(id: u32) -> Self {
        Self {
            id,
            kind: FrameKind::Fin,
            payload: Bytes::new(),
        }
    }
}

/// Length-prefixed codec for mux frames.
#[derive(Debug, Default)]
struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the length before reserving or splitting anything.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        if length < BODY_PREFIX_LEN {
            return Err(MuxError::Malformed(format!("frame body of {length} bytes")));
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(length);
        let id = body.get_u32();
        let kind_byte = body.get_u8();
        let kind = FrameKind::from_byte(kind_byte)
            .ok_or_else(|| MuxError::Malformed(format!("unknown frame kind {kind_byte}")))?;

        Ok(Some(Frame {
            id,
            kind,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        let body_len = BODY_PREFIX_LEN + frame.payload.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + body_len);
        #[allow(clippy::cast_possible_truncation)] // Validated above.
        dst.put_u32(body_len as u32);
        dst.put_u32(frame.id);
        dst.put_u8(frame.kind.as_byte());
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// One logical byte channel inside a [`MuxSession`].
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Shutting down the write half
/// sends `FIN` to the peer; reads return EOF once the peer has finished
/// writing and the buffered data is drained. Dropping the stream closes both
/// directions.
#[derive(Debug)]
pub struct MuxStream {
    read: DuplexStream,
    write: DuplexStream,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

type InboundMap = Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>>;

/// A multiplexed session over one underlying connection.
///
/// Construction spawns the session's reader and writer tasks on the current
/// tokio runtime. The session stays usable until [`MuxSession::close`] is
/// called or the underlying connection fails, whichever comes first.
#[derive(Debug)]
pub struct MuxSession {
    cmd_tx: mpsc::Sender<Frame>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    inbound: InboundMap,
    next_stream_id: AtomicU32,
    shutdown: CancellationToken,
}

impl MuxSession {
    /// Layer a multiplexed session over `io`.
    ///
    /// Both peers must agree on roles: the dialing side constructs with
    /// [`Mode::Client`], the accepting side with [`Mode::Server`].
    pub fn new<T>(io: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (cmd_tx, cmd_rx) = mpsc::channel::<Frame>(64);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(ACCEPT_QUEUE);
        let inbound: InboundMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_writer(
            FramedWrite::new(write_half, MuxCodec),
            cmd_rx,
            shutdown.clone(),
        ));
        tokio::spawn(run_reader(
            FramedRead::new(read_half, MuxCodec),
            Arc::clone(&inbound),
            cmd_tx.clone(),
            accept_tx,
            shutdown.clone(),
        ));

        Self {
            cmd_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            inbound,
            next_stream_id: AtomicU32::new(match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            }),
            shutdown,
        }
    }

    /// Open a fresh stream toward the peer.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Closed`] if the session has been closed or the
    /// connection has failed.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Closed);
        }

        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = install_stream(id, &self.inbound, self.cmd_tx.clone());
        if self.cmd_tx.send(Frame::syn(id)).await.is_err() {
            self.inbound.lock().expect("lock poisoned").remove(&id);
            return Err(MuxError::Closed);
        }
        trace!(id, "opened mux stream");
        Ok(stream)
    }

    /// Wait for the peer to open a stream.
    ///
    /// Streams are yielded in the order the peer opened them.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Closed`] once the session is closed and all
    /// previously opened streams have been claimed.
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(MuxError::Closed)
    }

    /// Close the session: tear down every stream and the connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether the session has been closed (locally or by connection loss).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Wire up the per-stream plumbing and return the user-facing handle.
///
/// Two bounded pipes back each stream: the inbound pump writes decoded DATA
/// into one, the outbound relay drains the other into DATA frames and sends
/// `FIN` when the user shuts the write half down.
fn install_stream(id: u32, inbound: &InboundMap, cmd_tx: mpsc::Sender<Frame>) -> MuxStream {
    // Each direction is one in-memory pipe; only one side of each duplex
    // pair is ever written. Duplex ends close their pipe when dropped,
    // which is what carries EOF to the other end.
    let (in_user, mut in_pump) = duplex(STREAM_BUFFER);
    let (out_user, mut out_relay) = duplex(STREAM_BUFFER);
    let (data_tx, mut data_rx) = mpsc::channel::<Bytes>(INBOUND_QUEUE);

    inbound.lock().expect("lock poisoned").insert(id, data_tx);

    // Inbound pump: decoded frames -> stream read buffer. Shutting the
    // pipe down on exit is what surfaces EOF to the stream's reader.
    tokio::spawn(async move {
        while let Some(chunk) = data_rx.recv().await {
            if in_pump.write_all(&chunk).await.is_err() {
                // Consumer dropped the stream; discard the rest.
                break;
            }
        }
        let _ = in_pump.shutdown().await;
    });

    // Outbound relay: stream write buffer -> DATA frames, then FIN.
    tokio::spawn(async move {
        let mut buf = vec![0u8; DATA_CHUNK];
        loop {
            match out_relay.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if cmd_tx.send(Frame::data(id, chunk)).await.is_err() {
                        // Session gone; nothing left to notify.
                        return;
                    }
                },
            }
        }
        let _ = cmd_tx.send(Frame::fin(id)).await;
    });

    MuxStream {
        read: in_user,
        write: out_user,
    }
}

async fn run_writer<W>(
    mut sink: FramedWrite<WriteHalf<W>, MuxCodec>,
    mut cmd_rx: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            frame = cmd_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "mux writer failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
    shutdown.cancel();
}

async fn run_reader<R>(
    mut frames: FramedRead<ReadHalf<R>, MuxCodec>,
    inbound: InboundMap,
    cmd_tx: mpsc::Sender<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "mux reader failed");
                break;
            },
            None => break,
        };

        match frame.kind {
            FrameKind::Syn => {
                let known = inbound
                    .lock()
                    .expect("lock poisoned")
                    .contains_key(&frame.id);
                if known {
                    debug!(id = frame.id, "duplicate SYN ignored");
                    continue;
                }
                let stream = install_stream(frame.id, &inbound, cmd_tx.clone());
                if accept_tx.send(stream).await.is_err() {
                    break;
                }
            },
            FrameKind::Data => {
                let tx = inbound
                    .lock()
                    .expect("lock poisoned")
                    .get(&frame.id)
                    .cloned();
                if let Some(tx) = tx {
                    if tx.send(frame.payload).await.is_err() {
                        // Stream consumer is gone; stop tracking it.
                        inbound.lock().expect("lock poisoned").remove(&frame.id);
                    }
                }
            },
            FrameKind::Fin => {
                inbound.lock().expect("lock poisoned").remove(&frame.id);
            },
        }
    }

    // Dropping the senders drains each stream to EOF.
    inbound.lock().expect("lock poisoned").clear();
    shutdown.cancel();
}

/// Multiplexer errors.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The session is closed or the connection is gone.
    #[error("mux session closed")]
    Closed,

    /// Underlying connection I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded the size limit.
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A frame failed structural validation.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (MuxSession::new(a, Mode::Client), MuxSession::new(b, Mode::Server))
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (client, server) = session_pair();

        let mut c = client.open_stream().await.unwrap();
        let mut s = server.accept_stream().await.unwrap();

        c.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        s.write_all(b"pong").await.unwrap();
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_streams_accepted_in_open_order() {
        let (client, server) = session_pair();

        for i in 0u8..3 {
            let mut stream = client.open_stream().await.unwrap();
            stream.write_all(&[i]).await.unwrap();
        }

        for i in 0u8..3 {
            let mut stream = server.accept_stream().await.unwrap();
            let mut buf = [0u8; 1];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf[0], i, "stream {i} out of order");
        }
    }

    #[tokio::test]
    async fn test_stream_close_leaves_siblings_alive() {
        let (client, server) = session_pair();

        let mut first = client.open_stream().await.unwrap();
        let mut second = client.open_stream().await.unwrap();
        let mut first_peer = server.accept_stream().await.unwrap();
        let mut second_peer = server.accept_stream().await.unwrap();

        first.shutdown().await.unwrap();
        drop(first);

        // Peer of the closed stream drains to EOF.
        let mut buf = Vec::new();
        first_peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // Sibling still carries data both ways.
        second.write_all(b"still here").await.unwrap();
        let mut got = [0u8; 10];
        second_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"still here");
    }

    #[tokio::test]
    async fn test_half_close_allows_reads() {
        let (client, server) = session_pair();

        let mut c = client.open_stream().await.unwrap();
        let mut s = server.accept_stream().await.unwrap();

        c.write_all(b"done").await.unwrap();
        c.shutdown().await.unwrap();

        let mut buf = Vec::new();
        s.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"done");

        // The reverse direction is still open.
        s.write_all(b"reply").await.unwrap();
        let mut got = [0u8; 5];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply");
    }

    #[tokio::test]
    async fn test_session_close_fails_open_and_accept() {
        let (client, server) = session_pair();

        client.close();
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream().await,
            Err(MuxError::Closed)
        ));

        // Peer observes the teardown as EOF and stops accepting.
        assert!(matches!(
            server.accept_stream().await,
            Err(MuxError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_large_transfer_chunks() {
        let (client, server) = session_pair();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut c = client.open_stream().await.unwrap();
        let mut s = server.accept_stream().await.unwrap();

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            c.write_all(&payload).await.unwrap();
            c.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        s.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = MuxCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::data(7, Bytes::from_static(b"abc")), &mut buf)
            .unwrap();

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(&frame.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized_frame() {
        let mut codec = MuxCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(u32::try_from(MAX_FRAME_SIZE + 1).unwrap());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(MuxError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_codec_rejects_unknown_kind() {
        let mut codec = MuxCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u32(1);
        buf.put_u8(9);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(MuxError::Malformed(_))
        ));
    }
}
