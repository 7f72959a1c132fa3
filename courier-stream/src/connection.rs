//! Per-connection state: identity, lifecycle state machine, outbound
//! queues, and liveness bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use courier_core::models::{ClientToken, OutboundMessage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::Frame;

/// Control frames (pings, shutdown close) bypass the bounded message
/// queue so a backlogged consumer cannot suppress its own heartbeat.
const CONTROL_QUEUE_CAPACITY: usize = 8;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one connection instance.
///
/// A reconnect always gets a fresh id, even under the same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle: `Connecting -> Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress; not yet visible to lookup/snapshot
    Connecting,
    /// Registered, eligible for delivery and heartbeat checks
    Open,
    /// Teardown initiated; no further sends accepted
    Closing,
    /// Terminal; resources released, registry entry gone
    Closed,
}

/// Why a connection entered `Closing`. The first trigger wins; later
/// triggers are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or ended the stream
    ClientClosed,
    /// No pong (or other traffic) within the write-wait window
    HeartbeatTimeout,
    /// Outbound queue overflowed; the consumer cannot keep up
    SlowConsumer,
    /// Broker-wide shutdown sweep
    Shutdown,
    /// Read/write failure on the underlying stream
    Transport,
    /// Malformed or unexpected frame from the peer
    Protocol,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::ClientClosed => "client closed",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SlowConsumer => "slow consumer",
            Self::Shutdown => "shutdown",
            Self::Transport => "transport error",
            Self::Protocol => "protocol violation",
        };
        write!(f, "{reason}")
    }
}

/// Failure modes of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity: the connection is a slow consumer
    Full,
    /// Connection is not `Open` (still connecting, or tearing down)
    NotOpen,
}

/// Receiving halves of a connection's queues, handed to the writer task.
pub struct ConnectionQueues {
    pub messages: mpsc::Receiver<OutboundMessage>,
    pub control: mpsc::Receiver<Frame>,
}

/// Handle to one live client connection.
///
/// Owned by the [`crate::Registry`] for its lifetime; the reader,
/// writer, and heartbeat tasks each hold an `Arc`. All state
/// transitions go through [`Connection::begin_close`], which is safe
/// to race from any trigger.
pub struct Connection {
    id: ConnectionId,
    token: ClientToken,
    opened_at: Instant,
    state: Mutex<ConnectionState>,
    close_reason: Mutex<Option<CloseReason>>,
    last_seen: Mutex<Instant>,
    messages: mpsc::Sender<OutboundMessage>,
    control: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection in `Connecting` with a bounded outbound
    /// queue. Returns the shared handle plus the queue receivers for
    /// the writer task.
    #[must_use]
    pub fn new(
        token: ClientToken,
        queue_capacity: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, ConnectionQueues) {
        let (message_tx, message_rx) = mpsc::channel(queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let now = Instant::now();

        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            token,
            opened_at: now,
            state: Mutex::new(ConnectionState::Connecting),
            close_reason: Mutex::new(None),
            last_seen: Mutex::new(now),
            messages: message_tx,
            control: control_tx,
            cancel,
        });

        (
            connection,
            ConnectionQueues {
                messages: message_rx,
                control: control_rx,
            },
        )
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn token(&self) -> &ClientToken {
        &self.token
    }

    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Promote `Connecting -> Open`. Called by the registry while it
    /// holds its own lock, so registration and promotion are atomic
    /// with respect to lookups.
    pub(crate) fn set_open(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Open;
        }
    }

    /// Initiate teardown. Idempotent and race-safe: the first caller
    /// records the reason and fires the cancellation token, every
    /// later caller is a no-op. Returns whether this call initiated
    /// the close.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connecting | ConnectionState::Open => {
                    *state = ConnectionState::Closing;
                }
                ConnectionState::Closing | ConnectionState::Closed => return false,
            }
            *self.close_reason.lock() = Some(reason);
        }
        debug!(connection_id = %self.id, token = %self.token, %reason, "Connection closing");
        self.cancel.cancel();
        true
    }

    /// Terminal transition, once teardown has finished and the
    /// registry entry is gone.
    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Non-blocking enqueue of an outbound message. FIFO within this
    /// connection; never waits on a lagging consumer.
    pub fn try_enqueue(&self, message: OutboundMessage) -> Result<(), EnqueueError> {
        if !self.is_open() {
            return Err(EnqueueError::NotOpen);
        }
        self.messages.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::NotOpen,
        })
    }

    /// Queue a control frame for the writer, ahead of pending messages.
    pub(crate) fn send_control(&self, frame: Frame) -> Result<(), EnqueueError> {
        self.control.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::NotOpen,
        })
    }

    /// Record inbound traffic as proof of liveness.
    pub fn record_activity(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Resolves once teardown has been initiated from any trigger.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection(capacity: usize) -> (Arc<Connection>, ConnectionQueues) {
        Connection::new(
            ClientToken::from("token-a"),
            capacity,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_state_machine_happy_path() {
        let (conn, _queues) = test_connection(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);

        conn.set_open();
        assert_eq!(conn.state(), ConnectionState::Open);

        assert!(conn.begin_close(CloseReason::ClientClosed));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.is_cancelled());

        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.close_reason(), Some(CloseReason::ClientClosed));
    }

    #[tokio::test]
    async fn test_begin_close_is_idempotent() {
        let (conn, _queues) = test_connection(4);
        conn.set_open();

        assert!(conn.begin_close(CloseReason::HeartbeatTimeout));
        // A racing second trigger must be a no-op and keep the first reason.
        assert!(!conn.begin_close(CloseReason::SlowConsumer));
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_enqueue_rejected_unless_open() {
        let (conn, _queues) = test_connection(4);
        let message = OutboundMessage::broadcast("hi");

        assert_eq!(
            conn.try_enqueue(message.clone()),
            Err(EnqueueError::NotOpen)
        );

        conn.set_open();
        assert!(conn.try_enqueue(message.clone()).is_ok());

        conn.begin_close(CloseReason::Shutdown);
        assert_eq!(conn.try_enqueue(message), Err(EnqueueError::NotOpen));
    }

    #[tokio::test]
    async fn test_enqueue_reports_full_queue() {
        let (conn, _queues) = test_connection(1);
        conn.set_open();

        assert!(conn.try_enqueue(OutboundMessage::broadcast("one")).is_ok());
        assert_eq!(
            conn.try_enqueue(OutboundMessage::broadcast("two")),
            Err(EnqueueError::Full)
        );
    }

    #[tokio::test]
    async fn test_queue_preserves_fifo_order() {
        let (conn, mut queues) = test_connection(8);
        conn.set_open();

        for payload in ["first", "second", "third"] {
            conn.try_enqueue(OutboundMessage::broadcast(payload))
                .expect("queue has room");
        }

        for expected in ["first", "second", "third"] {
            let got = queues.messages.recv().await.expect("message queued");
            assert_eq!(got.payload, bytes::Bytes::from(expected));
        }
    }

    #[tokio::test]
    async fn test_reconnect_gets_fresh_id() {
        let (first, _q1) = test_connection(4);
        let (second, _q2) = test_connection(4);
        assert_ne!(first.id(), second.id());
    }
}
