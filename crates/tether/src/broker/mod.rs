//! Stream broker: pairs a dial on one side with an accept on the other.
//!
//! A dispensed service gets its own stream, but the two peers discover that
//! stream asynchronously: one side reserves an id (a small, synchronous
//! control-RPC payload), the other side later opens a fresh mux stream and
//! announces the id as a 4-byte little-endian preamble. The broker marries
//! the two, acknowledging with the same id so the dialer knows the stream
//! was claimed rather than abandoned.
//!
//! Every rendezvous is bounded: an accept waits at most five seconds, and an
//! inbound stream nobody claims within five seconds is closed by a reaper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mux::{MuxError, MuxSession, MuxStream};

/// How long a rendezvous may stay unmatched on either side.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// One pending rendezvous: a one-slot handoff channel plus a completion
/// signal the reaper watches so a claimed stream is never closed under the
/// claimant.
struct Rendezvous {
    tx: mpsc::Sender<MuxStream>,
    rx: Option<mpsc::Receiver<MuxStream>>,
    claimed: CancellationToken,
}

impl Rendezvous {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Some(rx),
            claimed: CancellationToken::new(),
        }
    }
}

/// Broker for dynamic, per-dispense streams over a [`MuxSession`].
pub struct StreamBroker {
    session: Arc<MuxSession>,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Rendezvous>>,
}

impl StreamBroker {
    /// Create a broker over `session`.
    ///
    /// Call [`StreamBroker::run`] on a task afterwards; nothing is accepted
    /// until the run loop is live.
    #[must_use]
    pub fn new(session: Arc<MuxSession>) -> Self {
        Self {
            session,
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a fresh stream id.
    ///
    /// Ids start at 1 and are never reused within a session. The side that
    /// intends to accept allocates the id and transmits it over control RPC.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Open a stream for `id` toward the peer and wait for its ack.
    ///
    /// Writes the id as a little-endian u32 preamble and expects the same
    /// four bytes back once the peer's accept claims the stream.
    ///
    /// # Errors
    ///
    /// Fails if the session is closed, the preamble I/O fails, or the peer
    /// acknowledges a different id; the stream is closed in every failure
    /// case.
    pub async fn dial(&self, id: u32) -> Result<MuxStream, BrokerError> {
        let mut stream = self.session.open_stream().await?;
        stream.write_all(&id.to_le_bytes()).await?;

        let mut ack_buf = [0u8; 4];
        stream.read_exact(&mut ack_buf).await?;
        let ack = u32::from_le_bytes(ack_buf);
        if ack != id {
            return Err(BrokerError::BadAck { got: ack, want: id });
        }
        Ok(stream)
    }

    /// Wait up to five seconds for the peer to dial `id`, then ack it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AcceptTimeout`] if no matching stream arrives
    /// in time (the pending entry is removed), [`BrokerError::AcceptBusy`]
    /// if another accept for the same id is already waiting, or an I/O error
    /// if the ack cannot be written.
    pub async fn accept(&self, id: u32) -> Result<MuxStream, BrokerError> {
        let (mut rx, claimed) = {
            let mut pending = self.pending.lock().expect("lock poisoned");
            let entry = pending.entry(id).or_insert_with(Rendezvous::new);
            let rx = entry.rx.take().ok_or(BrokerError::AcceptBusy(id))?;
            (rx, entry.claimed.clone())
        };

        match tokio::time::timeout(ACCEPT_TIMEOUT, rx.recv()).await {
            Ok(Some(mut stream)) => {
                // Mark the handoff complete before acking so the reaper
                // never closes a claimed stream.
                claimed.cancel();
                self.pending.lock().expect("lock poisoned").remove(&id);
                stream.write_all(&id.to_le_bytes()).await?;
                Ok(stream)
            },
            // The sender is dropped only when the entry was reaped.
            Ok(None) | Err(_) => {
                self.pending.lock().expect("lock poisoned").remove(&id);
                Err(BrokerError::AcceptTimeout)
            },
        }
    }

    /// Accept loop: route inbound streams to their rendezvous by preamble.
    ///
    /// Runs until the session closes. Each inbound stream's first four bytes
    /// name its rendezvous; the stream is placed non-blockingly into the
    /// one-slot channel (and dropped if a stream for that id is already
    /// parked there), and a reaper closes it if nobody claims it in time.
    pub async fn run(self: Arc<Self>) {
        loop {
            let mut stream = match self.session.accept_stream().await {
                Ok(stream) => stream,
                Err(_) => break,
            };

            let mut id_buf = [0u8; 4];
            if stream.read_exact(&mut id_buf).await.is_err() {
                continue;
            }
            let id = u32::from_le_bytes(id_buf);

            let (tx, claimed) = {
                let mut pending = self.pending.lock().expect("lock poisoned");
                let entry = pending.entry(id).or_insert_with(Rendezvous::new);
                (entry.tx.clone(), entry.claimed.clone())
            };

            if tx.try_send(stream).is_err() {
                debug!(id, "rendezvous slot already full; dropping stream");
            }

            let broker = Arc::clone(&self);
            tokio::spawn(async move { broker.reap(id, claimed).await });
        }
    }

    /// Close the underlying session; outstanding rendezvous fail implicitly.
    pub fn close(&self) {
        self.session.close();
    }

    /// Wait for a parked stream to be claimed, closing it on timeout.
    async fn reap(&self, id: u32, claimed: CancellationToken) {
        let timed_out = tokio::select! {
            () = claimed.cancelled() => false,
            () = tokio::time::sleep(ACCEPT_TIMEOUT) => true,
        };

        let entry = self.pending.lock().expect("lock poisoned").remove(&id);
        if !timed_out {
            return;
        }

        if let Some(mut entry) = entry {
            // Non-blocking drain: the slot may be empty if the stream was
            // claimed between the timeout firing and the entry removal.
            if let Some(mut rx) = entry.rx.take() {
                if let Ok(stream) = rx.try_recv() {
                    debug!(id, "rendezvous timed out; closing unclaimed stream");
                    drop(stream);
                }
            }
        }
    }
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No matching dial arrived within the rendezvous window.
    #[error("timeout waiting for accept")]
    AcceptTimeout,

    /// Another accept for the same id is already waiting.
    #[error("accept already pending for stream {0}")]
    AcceptBusy(u32),

    /// The peer acknowledged the wrong stream id.
    #[error("bad ack: {got} (expected {want})")]
    BadAck {
        /// Id the peer sent back.
        got: u32,
        /// Id this side dialed.
        want: u32,
    },

    /// The session rejected the stream open.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// Preamble or ack I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Mode;

    fn broker_pair() -> (Arc<StreamBroker>, Arc<StreamBroker>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(StreamBroker::new(Arc::new(MuxSession::new(a, Mode::Client))));
        let server = Arc::new(StreamBroker::new(Arc::new(MuxSession::new(b, Mode::Server))));
        (client, server)
    }

    #[tokio::test]
    async fn test_next_id_starts_at_one_and_is_unique() {
        let (_guard, broker) = {
            let (a, b) = tokio::io::duplex(1024);
            (a, StreamBroker::new(Arc::new(MuxSession::new(b, Mode::Server))))
        };

        let mut seen = std::collections::HashSet::new();
        for expected in 1..=100u32 {
            let id = broker.next_id();
            assert_eq!(id, expected);
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_dial_accept_rendezvous() {
        let (client, server) = broker_pair();
        tokio::spawn(Arc::clone(&server).run());

        let id = server.next_id();
        let accepter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept(id).await })
        };

        let mut dialed = client.dial(id).await.unwrap();
        let mut accepted = accepter.await.unwrap().unwrap();

        dialed.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_dial_fails_on_wrong_ack() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client_session = Arc::new(MuxSession::new(a, Mode::Client));
        let server_session = Arc::new(MuxSession::new(b, Mode::Server));
        let client = StreamBroker::new(Arc::clone(&client_session));

        // Fake peer: claim the stream but ack a different id.
        tokio::spawn(async move {
            let mut stream = server_session.accept_stream().await.unwrap();
            let mut id_buf = [0u8; 4];
            stream.read_exact(&mut id_buf).await.unwrap();
            stream.write_all(&99u32.to_le_bytes()).await.unwrap();
            // Hold the stream open until the dialer has judged the ack.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let err = client.dial(7).await.unwrap_err();
        assert!(matches!(err, BrokerError::BadAck { got: 99, want: 7 }));
        assert_eq!(err.to_string(), "bad ack: 99 (expected 7)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_times_out_and_clears_entry() {
        let (client, server) = broker_pair();
        drop(client);

        let err = server.accept(4).await.unwrap_err();
        assert!(matches!(err, BrokerError::AcceptTimeout));
        assert_eq!(err.to_string(), "timeout waiting for accept");
        assert!(server.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_accept_for_same_id_is_rejected() {
        let (_client, server) = broker_pair();

        let id = server.next_id();
        let first = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept(id).await })
        };
        // Let the first accept take the receiver slot.
        tokio::task::yield_now().await;

        let err = server.accept(id).await.unwrap_err();
        assert!(matches!(err, BrokerError::AcceptBusy(got) if got == id));
        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_stream_is_reaped() {
        let (client, server) = broker_pair();
        tokio::spawn(Arc::clone(&server).run());

        // Dial an id nobody will ever accept. The ack never comes, so the
        // dial fails once the reaper closes the stream.
        let err = client.dial(42).await.unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)));
        assert!(server.pending.lock().unwrap().is_empty());
    }
}
