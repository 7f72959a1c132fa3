//! In-memory transport and collaborator stand-ins for tests.
//!
//! `transport_pair` yields the server-side [`FrameSink`]/[`FrameStream`]
//! halves plus a [`TestClient`] that plays the remote peer: it injects
//! inbound frames (pongs, closes, malformed input) and observes what
//! the broker wrote.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::models::ClientToken;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::reconciler::LastUsedSink;
use crate::transport::{Frame, FrameSink, FrameStream, TransportError};

/// Server-side inbound half backed by a channel.
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

/// Server-side outbound half backed by a channel.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Io("peer went away".to_string()))
    }
}

/// The remote peer's end of an in-memory connection.
pub struct TestClient {
    to_server: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

impl TestClient {
    /// Inject an inbound frame as if the peer had sent it.
    pub fn send(&self, frame: Frame) {
        let _ = self.to_server.send(Ok(frame));
    }

    /// Inject a transport-level failure.
    pub fn send_error(&self, error: TransportError) {
        let _ = self.to_server.send(Err(error));
    }

    /// Next frame the server wrote, if any.
    pub async fn next(&mut self) -> Option<Frame> {
        self.from_server.recv().await
    }

    /// Drop the inbound half, as an abrupt disconnect would.
    pub fn disconnect(self) {}

    /// Run the peer in the background: answer every ping with a pong
    /// and collect message payloads into the returned buffer.
    #[must_use]
    pub fn spawn_echo(mut self) -> Arc<Mutex<Vec<bytes::Bytes>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            while let Some(frame) = self.from_server.recv().await {
                match frame {
                    Frame::Ping => self.send(Frame::Pong),
                    Frame::Message(payload) => sink.lock().push(payload),
                    Frame::Pong | Frame::Close => {}
                }
            }
        });
        received
    }
}

/// Build a connected in-memory transport: the server halves plus the
/// peer's [`TestClient`].
#[must_use]
pub fn transport_pair() -> (MemoryStream, MemorySink, TestClient) {
    let (to_server, server_rx) = mpsc::unbounded_channel();
    let (server_tx, from_server) = mpsc::unbounded_channel();
    (
        MemoryStream { rx: server_rx },
        MemorySink { tx: server_tx },
        TestClient {
            to_server,
            from_server,
        },
    )
}

/// Last-used sink that discards every report.
pub struct NullSink;

#[async_trait]
impl LastUsedSink for NullSink {
    async fn update_last_used(&self, _tokens: Vec<ClientToken>, _timestamp: DateTime<Utc>) {}
}

/// Last-used sink that records every report for assertions.
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<(Vec<ClientToken>, DateTime<Utc>)>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<(Vec<ClientToken>, DateTime<Utc>)> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl LastUsedSink for RecordingSink {
    async fn update_last_used(&self, tokens: Vec<ClientToken>, timestamp: DateTime<Utc>) {
        self.reports.lock().push((tokens, timestamp));
    }
}
