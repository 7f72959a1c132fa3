//! Broker facade: the externally visible lifecycle object.
//!
//! Owns the registry, dispatcher, reconciler, and every per-connection
//! task. Per the task model, each connection gets one reader task, one
//! writer task, and one heartbeat task; all of them hang off a child
//! of the broker's root cancellation token, so `close()` provably
//! reaches everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_core::models::{ClientToken, OutboundMessage};
use regex::Regex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{CloseReason, Connection, ConnectionId, ConnectionQueues};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::reconciler::{self, LastUsedSink};
use crate::registry::Registry;
use crate::transport::{Frame, FrameSink, FrameStream, TransportError};

/// Tunables of the broker, normally mapped from `StreamConfig`.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Interval between heartbeat pings (P)
    pub ping_period: Duration,
    /// Pong/flush deadline (W); must satisfy W < P
    pub write_wait: Duration,
    /// Interval between last-used reconciliation passes
    pub reconcile_period: Duration,
    /// Regex patterns for allowed origins, matched against the
    /// lowercased origin host and against host:port; empty means
    /// same-origin only
    pub allowed_origins: Vec<String>,
    /// Per-connection outbound queue capacity
    pub queue_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(45),
            write_wait: Duration::from_secs(15),
            reconcile_period: Duration::from_secs(300),
            allowed_origins: Vec::new(),
            queue_capacity: 64,
        }
    }
}

/// Real-time delivery broker.
///
/// Entry point for new connections, fanout dispatch, the connected
/// snapshot, and coordinated shutdown.
pub struct Broker {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    options: BrokerOptions,
    origins: Vec<Regex>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Broker {
    /// Build the broker and start its reconciliation loop.
    ///
    /// Fails on an inconsistent configuration (zero periods, W >= P,
    /// an origin pattern that does not compile); the broker never
    /// starts in that state. Must run inside a tokio runtime.
    pub fn new(options: BrokerOptions, sink: Arc<dyn LastUsedSink>) -> Result<Self> {
        if options.ping_period.is_zero() || options.write_wait.is_zero() {
            return Err(Error::Configuration(
                "ping period and write wait must be greater than zero".to_string(),
            ));
        }
        if options.write_wait >= options.ping_period {
            return Err(Error::Configuration(format!(
                "write wait ({:?}) must be shorter than the ping period ({:?})",
                options.write_wait, options.ping_period
            )));
        }
        if options.queue_capacity == 0 {
            return Err(Error::Configuration(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        let origins = options
            .allowed_origins
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                    Error::Configuration(format!("invalid allowed origin pattern {pattern:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(reconciler::run(
            Arc::clone(&registry),
            sink,
            options.reconcile_period,
            cancel.clone(),
        ));

        Ok(Self {
            registry,
            dispatcher,
            options,
            origins,
            cancel,
            tracker,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether an upgrade request from `origin` may proceed.
    ///
    /// No Origin header is allowed (non-browser client); an origin on
    /// the same host as the request is allowed; anything else must
    /// match one of the configured patterns. Consulted by the HTTP
    /// layer before a connection ever reaches `Connecting`.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>, host: &str) -> bool {
        let Some(origin) = origin else { return true };
        let Ok(parsed) = Url::parse(origin) else {
            return false;
        };
        let Some(origin_host) = parsed.host_str() else {
            return false;
        };

        let origin_authority = match parsed.port() {
            Some(port) => format!("{origin_host}:{port}"),
            None => origin_host.to_string(),
        };
        if origin_authority.eq_ignore_ascii_case(host) || origin_host.eq_ignore_ascii_case(host) {
            return true;
        }

        // Patterns may name either the bare host or host:port.
        let lowered_host = origin_host.to_ascii_lowercase();
        let lowered_authority = origin_authority.to_ascii_lowercase();
        self.origins
            .iter()
            .any(|re| re.is_match(&lowered_host) || re.is_match(&lowered_authority))
    }

    /// Accept a handshaken transport as a new connection and spawn its
    /// reader, writer, and heartbeat tasks.
    ///
    /// Fails with [`Error::Closed`] once shutdown has begun; the
    /// caller must then close the transport immediately.
    pub fn open_connection<R, W>(
        &self,
        token: ClientToken,
        stream: R,
        sink: W,
    ) -> Result<ConnectionId>
    where
        R: FrameStream + 'static,
        W: FrameSink + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let (connection, queues) = Connection::new(
            token,
            self.options.queue_capacity,
            self.cancel.child_token(),
        );
        // Registration promotes Connecting -> Open atomically, or
        // reports Closed if the shutdown sweep won the race.
        self.registry.register(&connection)?;

        let id = connection.id();
        let heartbeat = Heartbeat {
            ping_period: self.options.ping_period,
            write_wait: self.options.write_wait,
        };
        let registry = Arc::clone(&self.registry);
        let write_wait = self.options.write_wait;

        self.tracker.spawn(async move {
            let reader = tokio::spawn(read_loop(Arc::clone(&connection), stream));
            let writer = tokio::spawn(write_loop(
                Arc::clone(&connection),
                sink,
                queues,
                write_wait,
            ));
            let pinger = tokio::spawn(heartbeat.run(Arc::clone(&connection)));

            // All three end once any trigger cancels the connection.
            let _ = reader.await;
            let _ = writer.await;
            let _ = pinger.await;

            // Teardown: registry entry removed synchronously, then the
            // terminal state. A reconnect builds a fresh Connection.
            connection.begin_close(CloseReason::Transport);
            registry.unregister(connection.id());
            connection.mark_closed();
        });

        Ok(id)
    }

    /// Fan one message out to its recipients (see [`Dispatcher`]).
    pub fn dispatch(&self, message: &OutboundMessage) -> DispatchOutcome {
        self.dispatcher.dispatch(message)
    }

    /// Distinct tokens with at least one live connection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ClientToken> {
        self.registry.snapshot()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    /// Coordinated shutdown: stop accepting connections, sweep every
    /// live one into `Closing`, and wait (bounded) for drains.
    ///
    /// Safe to call more than once, including concurrently; only the
    /// first call performs the shutdown sequence.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            active_connections = self.registry.connection_count(),
            "Broker shutting down"
        );

        let swept = self.registry.close();
        for connection in &swept {
            connection.begin_close(CloseReason::Shutdown);
        }
        self.cancel.cancel();
        self.tracker.close();

        if timeout(self.options.write_wait, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Some connection tasks did not drain within the grace period");
        }
        info!("Broker shut down");
    }
}

/// Reader task: inbound frames are proof of liveness; a close frame,
/// stream end, or error triggers teardown. Failures stay contained to
/// this connection.
async fn read_loop<R: FrameStream>(connection: Arc<Connection>, mut stream: R) {
    loop {
        let frame = tokio::select! {
            () = connection.cancelled() => return,
            frame = stream.next_frame() => frame,
        };
        match frame {
            Some(Ok(Frame::Close)) | None => {
                connection.begin_close(CloseReason::ClientClosed);
                return;
            }
            Some(Ok(_)) => connection.record_activity(),
            Some(Err(TransportError::Protocol(violation))) => {
                warn!(
                    connection_id = %connection.id(),
                    token = %connection.token(),
                    %violation,
                    "Protocol violation"
                );
                connection.begin_close(CloseReason::Protocol);
                return;
            }
            Some(Err(TransportError::Io(error))) => {
                debug!(connection_id = %connection.id(), %error, "Transport read failed");
                connection.begin_close(CloseReason::Transport);
                return;
            }
        }
    }
}

/// Writer task: drains the control and message queues with a per-flush
/// deadline of W, control frames first. On cancellation the remaining
/// queued messages are drained best-effort within W, then a close
/// frame is sent.
async fn write_loop<W: FrameSink>(
    connection: Arc<Connection>,
    mut sink: W,
    mut queues: ConnectionQueues,
    write_wait: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = connection.cancelled() => break,
            frame = queues.control.recv() => frame,
            message = queues.messages.recv() => message.map(|m| Frame::Message(m.payload)),
        };
        let Some(frame) = frame else { break };
        if !flush(&connection, &mut sink, frame, write_wait).await {
            return;
        }
    }

    // Best-effort drain of whatever was queued before Closing.
    let deadline = Instant::now() + write_wait;
    while let Ok(message) = queues.messages.try_recv() {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
            break;
        };
        match timeout(remaining, sink.send(Frame::Message(message.payload))).await {
            Ok(Ok(())) => {}
            _ => return,
        }
    }
    let _ = timeout(write_wait, sink.send(Frame::Close)).await;
}

/// Flush one frame within the write-wait deadline. A stalled flush
/// counts as a dead peer, a failed one as a transport error; either
/// way the connection is done. Returns whether the writer should
/// continue.
async fn flush<W: FrameSink>(
    connection: &Arc<Connection>,
    sink: &mut W,
    frame: Frame,
    write_wait: Duration,
) -> bool {
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            debug!(connection_id = %connection.id(), %error, "Transport write failed");
            connection.begin_close(CloseReason::Transport);
            false
        }
        Err(_) => {
            debug!(connection_id = %connection.id(), "Write stalled past the write-wait window");
            connection.begin_close(CloseReason::HeartbeatTimeout);
            false
        }
    }
}
